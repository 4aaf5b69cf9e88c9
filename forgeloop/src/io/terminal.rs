//! Operator-facing terminal I/O and the numbered recovery menu.
//!
//! Product output (menus, guidance, resume instructions) goes through
//! [`Terminal`] so tests can script input and capture what was shown.

use std::io::{self, BufRead, IsTerminal, Write};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::core::recovery::{RecoveryAction, RecoveryOption};

pub trait Terminal {
    /// True when stdin and stdout are attached to a TTY.
    fn is_interactive(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<()>;
    /// One line of input without the trailing newline; `None` on EOF.
    fn read_line(&self) -> Result<Option<String>>;
    /// Open `url` in a browser. Returns false when opening is disabled.
    fn open_url(&self, url: &str) -> Result<bool>;
}

/// Real terminal on stdin/stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdTerminal {
    pub open_urls: bool,
}

impl StdTerminal {
    pub fn new(open_urls: bool) -> Self {
        Self { open_urls }
    }
}

impl Terminal for StdTerminal {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal() && io::stdout().is_terminal()
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{line}").context("write stdout")?;
        stdout.flush().context("flush stdout")
    }

    fn read_line(&self) -> Result<Option<String>> {
        let mut input = String::new();
        let bytes = io::stdin()
            .lock()
            .read_line(&mut input)
            .context("read selection")?;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(input.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn open_url(&self, url: &str) -> Result<bool> {
        if !self.open_urls {
            return Ok(false);
        }
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        };
        debug!(opener, url, "opening url");
        match Command::new(opener)
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(opener, err = %err, "failed to launch browser");
                Ok(false)
            }
        }
    }
}

/// Why no action was selected. Recoverable: the task stays as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MenuCanceled {
    #[error("recovery menu requires an interactive terminal")]
    NoTerminal,
    #[error("recovery canceled by user")]
    ByUser,
}

/// Show `options` as a numbered menu and read a choice.
///
/// Invalid input re-prompts; `q`, end of input or a Ctrl-C on `cancel`
/// cancels.
pub fn prompt_menu(
    terminal: &dyn Terminal,
    cancel: &CancellationToken,
    title: &str,
    options: &[RecoveryOption],
) -> Result<RecoveryAction> {
    if !terminal.is_interactive() {
        return Err(MenuCanceled::NoTerminal.into());
    }
    if cancel.is_cancelled() {
        return Err(MenuCanceled::ByUser.into());
    }
    terminal.write_line("")?;
    terminal.write_line(title)?;
    for (index, option) in options.iter().enumerate() {
        terminal.write_line(&format!(
            "  {}) {} - {}",
            index + 1,
            option.label,
            option.description
        ))?;
    }
    loop {
        terminal.write_line(&format!("Select an action [1-{}] (q to quit):", options.len()))?;
        let Some(input) = terminal.read_line()? else {
            return Err(MenuCanceled::ByUser.into());
        };
        let input = input.trim();
        if cancel.is_cancelled() || input.eq_ignore_ascii_case("q") {
            return Err(MenuCanceled::ByUser.into());
        }
        match input.parse::<usize>() {
            Ok(choice) if (1..=options.len()).contains(&choice) => {
                let action = options[choice - 1].action;
                debug!(%action, "menu selection");
                return Ok(action);
            }
            _ => terminal.write_line(&format!("Invalid selection '{input}'"))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recovery::recovery_options;
    use crate::core::types::TaskStatus;
    use crate::test_support::{ScriptedTerminal, TaskBuilder};

    fn options() -> Vec<RecoveryOption> {
        let task = TaskBuilder::new("ws")
            .steps(&["implement", "validate"])
            .status(TaskStatus::ValidationFailed)
            .build();
        recovery_options(&task)
    }

    #[test]
    fn re_prompts_until_valid_choice() {
        let terminal = ScriptedTerminal::new(&["9", "abc", "2"]);
        let action = prompt_menu(&terminal, &CancellationToken::new(), "Recovery", &options()).expect("choice");
        assert_eq!(action, RecoveryAction::FixManually);
        assert!(terminal.output().contains("Invalid selection '9'"));
        assert!(terminal.output().contains("1) Retry with AI fix"));
    }

    #[test]
    fn quit_and_eof_cancel() {
        let terminal = ScriptedTerminal::new(&["q"]);
        let err = prompt_menu(&terminal, &CancellationToken::new(), "Recovery", &options()).expect_err("quit");
        assert_eq!(
            err.downcast_ref::<MenuCanceled>(),
            Some(&MenuCanceled::ByUser)
        );

        let terminal = ScriptedTerminal::new(&[]);
        let err = prompt_menu(&terminal, &CancellationToken::new(), "Recovery", &options()).expect_err("eof");
        assert_eq!(
            err.downcast_ref::<MenuCanceled>(),
            Some(&MenuCanceled::ByUser)
        );
    }

    /// The SIGINT handler only sets the token; a line typed afterwards must
    /// not be taken as a choice.
    #[test]
    fn ctrl_c_cancels_before_and_after_reading() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let terminal = ScriptedTerminal::new(&["1"]);
        let err = prompt_menu(&terminal, &cancel, "Recovery", &options()).expect_err("canceled");
        assert_eq!(
            err.downcast_ref::<MenuCanceled>(),
            Some(&MenuCanceled::ByUser)
        );
        assert!(terminal.output().is_empty());

        let cancel = CancellationToken::new();
        let terminal = ScriptedTerminal::new(&[]);
        terminal.cancel_on_read(cancel.clone(), "1");
        let err = prompt_menu(&terminal, &cancel, "Recovery", &options()).expect_err("canceled");
        assert_eq!(
            err.downcast_ref::<MenuCanceled>(),
            Some(&MenuCanceled::ByUser)
        );
    }

    #[test]
    fn requires_terminal() {
        let terminal = ScriptedTerminal::non_interactive();
        let err = prompt_menu(&terminal, &CancellationToken::new(), "Recovery", &options()).expect_err("no tty");
        assert_eq!(
            err.downcast_ref::<MenuCanceled>(),
            Some(&MenuCanceled::NoTerminal)
        );
        assert!(terminal.output().is_empty());
    }
}
