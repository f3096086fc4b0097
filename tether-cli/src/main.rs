mod cli;
mod profile;

use std::io::Write;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use tether_ssh::{Session, SftpSession, runtime};

use crate::cli::{Cli, Command};
use crate::profile::{Profile, Target, load_profile};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .init();

    let profile = match &cli.profile {
        Some(path) => load_profile(path)?,
        None => Profile::default(),
    };
    let target = profile
        .merge(&cli.target)
        .resolve(std::env::var("USER").ok())?;

    let _runtime = runtime::startup();
    run(&target, cli.command)
}

fn run(target: &Target, command: Command) -> Result<ExitCode> {
    match command {
        Command::Exec { command, chomp } => {
            let session = login(target)?;
            let output = session
                .exec(&command, chomp)
                .with_context(|| format!("failed to run `{command}`"))?;
            if let Some(output) = output {
                print!("{output}");
            }
            session.close()?;
            Ok(ExitCode::SUCCESS)
        },
        Command::Capture { command, merge } => {
            let session = login(target)?;
            let channel = session.open_channel()?;
            let captured = if merge {
                channel.capture2e(&command)
            } else {
                channel.capture3(&command)
            }
            .with_context(|| format!("failed to run `{command}`"))?;
            let status = channel.close(true)?;

            print!("{}", captured.stdout);
            eprint!("{}", captured.stderr);
            session.close()?;

            if !captured.accepted {
                log::warn!("server refused to run `{command}`");
            }
            Ok(exit_code(status))
        },
        Command::Head { command, lines } => {
            let session = login(target)?;
            let channel = session.open_channel()?;
            let (mut stdout, accepted) = channel
                .popen2(&command)
                .with_context(|| format!("failed to run `{command}`"))?;
            if !accepted {
                log::warn!("server refused to run `{command}`");
            }

            let mut out = std::io::stdout().lock();
            for line in stdout.lines(false).take(lines) {
                out.write_all(line?.as_bytes())?;
            }
            drop(stdout);

            // Unread output is discarded by the waiting close.
            let status = channel.close(true)?;
            session.close()?;
            Ok(exit_code(status))
        },
        Command::Methods => {
            let session = connect(target)?;
            for method in session.userauth_methods(&target.user)? {
                println!("{method}");
            }
            session.close()?;
            Ok(ExitCode::SUCCESS)
        },
        Command::Fingerprint => {
            let session = connect(target)?;
            match session.fingerprint()? {
                Some(fingerprint) => println!("{fingerprint}"),
                None => log::warn!("server did not present a host key"),
            }
            session.close()?;
            Ok(ExitCode::SUCCESS)
        },
        Command::Ls { dir, long, paths } => {
            let sftp: SftpSession =
                SftpSession::connect(&target.host, target.port, &target.options)
                    .with_context(|| connect_context(target))?;
            sftp.login(Some(&target.user), target.password.as_deref())
                .context("sftp login failed")?;

            let mut stdout = std::io::stdout().lock();
            if paths {
                for path in sftp.entries(dir.as_deref())? {
                    writeln!(stdout, "{path}")?;
                }
            } else {
                for entry in sftp.list(dir.as_deref())? {
                    if long {
                        writeln!(stdout, "{entry}")?;
                    } else {
                        writeln!(stdout, "{}", entry.name)?;
                    }
                }
            }
            sftp.close()?;
            Ok(ExitCode::SUCCESS)
        },
    }
}

fn connect(target: &Target) -> Result<Session> {
    let session = Session::new();
    session
        .connect(&target.host, target.port, &target.options)
        .with_context(|| connect_context(target))?;
    Ok(session)
}

fn login(target: &Target) -> Result<Session> {
    let session = connect(target)?;
    session
        .login(&target.user, &target.auth)
        .with_context(|| format!("login as {} failed", target.user))?;
    Ok(session)
}

fn connect_context(target: &Target) -> String {
    format!("failed to connect to {}:{}", target.host, target.port)
}

fn exit_code(status: i32) -> ExitCode {
    u8::try_from(status).map_or(ExitCode::FAILURE, ExitCode::from)
}
