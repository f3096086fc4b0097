//! Run a few commands on a remote host over one SSH session.
//!
//! Required environment:
//! - `TETHER_EXAMPLE_TARGET` must contain `host` or `host:port`.
//! - `TETHER_EXAMPLE_USER` sets the username (defaults to `root`).
//! - `TETHER_EXAMPLE_PASSWORD` optionally provides a password; if omitted,
//!   ssh-agent identities are used.
//!
//! Run with:
//! `cargo run --package tether-ssh --example remote_exec`

use std::env;

use anyhow::{Context, Result};
use tether_ssh::{Auth, ConnectOptions, DEFAULT_PORT, Session, runtime};

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let target = env::var("TETHER_EXAMPLE_TARGET")
        .context("set TETHER_EXAMPLE_TARGET before running the example")?;
    let user =
        env::var("TETHER_EXAMPLE_USER").unwrap_or_else(|_| "root".into());
    let auth = match env::var("TETHER_EXAMPLE_PASSWORD") {
        Ok(password) => Auth::password(password),
        Err(_) => Auth::Agent,
    };

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().context("invalid port")?),
        None => (target.as_str(), DEFAULT_PORT),
    };

    let _runtime = runtime::startup();
    let session: Session = Session::start(
        host,
        port,
        &ConnectOptions::default(),
        Some((&user, &auth)),
    )?;

    if let Some(fingerprint) = session.fingerprint()? {
        println!("host key: {fingerprint}");
    }

    let uname = session.exec("uname -a", true)?;
    println!("{}", uname.unwrap_or_default());

    let channel = session.open_channel()?;
    let captured = channel.capture3("ls /; ls /does-not-exist")?;
    let status = channel.close(true)?;
    print!("{}", captured.stdout);
    eprint!("{}", captured.stderr);
    println!("exit status {status}");

    session.close()?;
    Ok(())
}
