use std::io::{Write, stderr};

use crossterm::{
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, read},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio_postgres::Config;

use crate::error::VacmanError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;

/// Standard libpq-style connection options, already merged with the `PG*`
/// environment by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub dbname: Option<String>,
    pub password: Option<String>,
}

impl ConnectOptions {
    /// The role to connect as: `-U`/`PGUSER`, else the login user.
    pub fn effective_user(&self) -> Option<String> {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
    }

    pub fn to_config(&self) -> Result<Config, VacmanError> {
        let user = self.effective_user().ok_or_else(|| {
            VacmanError::Configuration("no user name given and none found in the environment".to_string())
        })?;

        let mut config = Config::new();
        config
            .host(self.host.as_deref().unwrap_or(DEFAULT_HOST))
            .port(self.port.unwrap_or(DEFAULT_PORT))
            .dbname(self.dbname.as_deref().unwrap_or(&user))
            .user(&user);

        if let Some(password) = &self.password {
            config.password(password);
        }

        Ok(config)
    }
}

struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Reads a password from the terminal without echoing it.
pub fn prompt_password(prompt: &str) -> Result<String, VacmanError> {
    let mut out = stderr();
    write!(out, "{}", prompt)?;
    out.flush()?;

    enable_raw_mode()?;
    let guard = RawModeGuard;

    let mut password = String::new();
    let result = loop {
        match read()? {
            Event::Key(KeyEvent {
                code,
                modifiers,
                kind: KeyEventKind::Press,
                ..
            }) => match code {
                KeyCode::Enter => break Ok(()),
                KeyCode::Char('c') | KeyCode::Char('d') if modifiers.contains(KeyModifiers::CONTROL) => {
                    break Err(VacmanError::Configuration("password prompt interrupted".to_string()));
                }
                KeyCode::Char(c) => password.push(c),
                KeyCode::Backspace => {
                    password.pop();
                }
                _ => {}
            },
            Event::Paste(text) => password.push_str(&text),
            _ => {}
        }
    };

    drop(guard);
    write!(out, "\r\n")?;
    out.flush()?;

    result.map(|()| password)
}

#[cfg(test)]
mod tests {
    use tokio_postgres::config::Host;

    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectOptions {
            user: Some("vacman".to_string()),
            ..Default::default()
        };
        let config = options.to_config().unwrap();

        assert_eq!(config.get_user(), Some("vacman"));
        assert_eq!(config.get_dbname(), Some("vacman"));
        assert_eq!(config.get_ports(), &[DEFAULT_PORT]);
        assert_eq!(config.get_hosts(), &[Host::Tcp(DEFAULT_HOST.to_string())]);
        assert_eq!(config.get_password(), None);
    }

    #[test]
    fn test_explicit_options() {
        let options = ConnectOptions {
            host: Some("db.internal".to_string()),
            port: Some(6543),
            user: Some("admin".to_string()),
            dbname: Some("sales".to_string()),
            password: Some("secret".to_string()),
        };
        let config = options.to_config().unwrap();

        assert_eq!(config.get_dbname(), Some("sales"));
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_password(), Some(&b"secret"[..]));
    }
}
