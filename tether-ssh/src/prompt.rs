//! Secret prompting used by keyboard-interactive authentication.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};

use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::transport::KeyboardInteractive;

const TTY_PATH: &str = "/dev/tty";

/// Reads one secret reply for a server supplied label.
pub trait SecretPrompt {
    fn prompt(&mut self, label: &str) -> io::Result<SecretString>;
}

impl<F> SecretPrompt for F
where
    F: FnMut(&str) -> io::Result<SecretString>,
{
    fn prompt(&mut self, label: &str) -> io::Result<SecretString> {
        self(label)
    }
}

/// Prompts on the controlling terminal with echo disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn prompt(&mut self, label: &str) -> io::Result<SecretString> {
        let tty = OpenOptions::new().read(true).write(true).open(TTY_PATH)?;
        let mut writer = tty.try_clone()?;
        write!(writer, "{label}")?;
        writer.flush()?;

        let line = {
            let _echo = EchoGuard::disable(&tty)?;
            read_secret_line(BufReader::new(&tty))?
        };

        // Echo was off, so the user's newline never reached the terminal.
        writeln!(writer)?;
        Ok(line)
    }
}

/// Read one line, dropping the line terminator. The intermediate buffer is
/// wiped on drop.
fn read_secret_line(mut reader: impl BufRead) -> io::Result<SecretString> {
    let mut line = Zeroizing::new(String::new());
    reader.read_line(&mut line)?;

    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(SecretString::from(trimmed.to_owned()))
}

#[cfg(unix)]
struct EchoGuard<'a> {
    tty: &'a File,
    original: nix::sys::termios::Termios,
}

#[cfg(unix)]
impl<'a> EchoGuard<'a> {
    fn disable(tty: &'a File) -> io::Result<Self> {
        use nix::sys::termios::{self, LocalFlags, SetArg};

        let original = termios::tcgetattr(tty)?;
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        silent.local_flags.insert(LocalFlags::ECHONL);
        termios::tcsetattr(tty, SetArg::TCSAFLUSH, &silent)?;

        Ok(Self { tty, original })
    }
}

#[cfg(unix)]
impl Drop for EchoGuard<'_> {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};

        let _ = termios::tcsetattr(self.tty, SetArg::TCSANOW, &self.original);
    }
}

#[cfg(not(unix))]
struct EchoGuard;

#[cfg(not(unix))]
impl EchoGuard {
    fn disable(_tty: &File) -> io::Result<Self> {
        Ok(Self)
    }
}

/// Answers keyboard-interactive prompts with a [`SecretPrompt`].
pub(crate) struct PromptResponder<'a> {
    prompt: &'a mut dyn SecretPrompt,
}

impl<'a> PromptResponder<'a> {
    pub(crate) fn new(prompt: &'a mut dyn SecretPrompt) -> Self {
        Self { prompt }
    }
}

impl KeyboardInteractive for PromptResponder<'_> {
    fn respond(&mut self, prompts: &[String]) -> Vec<SecretString> {
        prompts
            .iter()
            .map(|label| {
                self.prompt.prompt(label).unwrap_or_else(|err| {
                    log::warn!("secret prompt failed, replying empty: {err}");
                    SecretString::from(String::new())
                })
            })
            .collect()
    }
}
