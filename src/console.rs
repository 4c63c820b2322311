//! Per-application output consoles.
//!
//! Build output, audit lines and container logs are user-facing output, not
//! diagnostics: they go to the console of the application (or container) they
//! belong to rather than through `tracing`.

use dashmap::DashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Output channel of a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    /// Standard output of a dockyard-run process (the build)
    Stdout,
    /// Standard error of a dockyard-run process (the build)
    Stderr,
    /// Standard output of the application
    AppOut,
    /// Standard error of the application
    AppErr,
}

impl LogType {
    /// Whether lines of this type report an error.
    pub fn is_error(self) -> bool {
        matches!(self, LogType::Stderr | LogType::AppErr)
    }
}

/// Log sink of one application.
pub trait AppConsole: Send + Sync {
    /// Write one line.
    fn write(&self, line: &str, kind: LogType);

    /// Record a command line for audit display.
    fn log_command(&self, command: &str);

    /// Byte sink that forwards complete lines to [`AppConsole::write`].
    fn output_stream(&self, kind: LogType) -> Box<dyn Write + Send>;
}

/// Looks up consoles by application or container name.
pub trait ConsoleProvider: Send + Sync {
    /// Console for `name`.
    fn console(&self, name: &str) -> Arc<dyn AppConsole>;
}

/// Splits a byte stream into lines for a console.
pub struct LineSink<C: AppConsole> {
    console: C,
    kind: LogType,
    pending: Vec<u8>,
}

impl<C: AppConsole> LineSink<C> {
    /// Sink writing to `console` as `kind`.
    pub fn new(console: C, kind: LogType) -> Self {
        Self {
            console,
            kind,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        let line = String::from_utf8_lossy(bytes);
        self.console
            .write(line.trim_end_matches(['\r', '\n']), self.kind);
    }
}

impl<C: AppConsole> Write for LineSink<C> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
        Ok(())
    }
}

impl<C: AppConsole> Drop for LineSink<C> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Console printing to the process' stdout/stderr, prefixed with its name.
#[derive(Debug, Clone)]
pub struct StdConsole {
    name: String,
}

impl StdConsole {
    /// Console for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl AppConsole for StdConsole {
    fn write(&self, line: &str, kind: LogType) {
        if kind.is_error() {
            eprintln!("[{}] {}", self.name, line);
        } else {
            println!("[{}] {}", self.name, line);
        }
    }

    fn log_command(&self, command: &str) {
        println!("[{}] $ {}", self.name, command);
    }

    fn output_stream(&self, kind: LogType) -> Box<dyn Write + Send> {
        Box::new(LineSink::new(self.clone(), kind))
    }
}

/// Provides [`StdConsole`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdConsoleProvider;

impl ConsoleProvider for StdConsoleProvider {
    fn console(&self, name: &str) -> Arc<dyn AppConsole> {
        Arc::new(StdConsole::new(name))
    }
}

#[derive(Debug, Default)]
struct Recorded {
    lines: Vec<(LogType, String)>,
    commands: Vec<String>,
}

/// Console that records everything written to it.
#[derive(Debug, Clone, Default)]
pub struct MemoryConsole {
    recorded: Arc<Mutex<Recorded>>,
}

impl MemoryConsole {
    /// Create an empty console.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line written so far.
    pub fn lines(&self) -> Vec<(LogType, String)> {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .lines
            .clone()
    }

    /// Lines of one channel.
    pub fn lines_of(&self, kind: LogType) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, line)| line)
            .collect()
    }

    /// Commands recorded via [`AppConsole::log_command`].
    pub fn commands(&self) -> Vec<String> {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .commands
            .clone()
    }

    /// Whether any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, line)| line.contains(needle))
    }
}

impl AppConsole for MemoryConsole {
    fn write(&self, line: &str, kind: LogType) {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .lines
            .push((kind, line.to_string()));
    }

    fn log_command(&self, command: &str) {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .commands
            .push(command.to_string());
    }

    fn output_stream(&self, kind: LogType) -> Box<dyn Write + Send> {
        Box::new(LineSink::new(self.clone(), kind))
    }
}

/// Provides one [`MemoryConsole`] per name.
#[derive(Debug, Default)]
pub struct MemoryConsoleProvider {
    consoles: DashMap<String, MemoryConsole>,
}

impl MemoryConsoleProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recording console for `name`.
    pub fn get(&self, name: &str) -> MemoryConsole {
        self.consoles.entry(name.to_string()).or_default().clone()
    }

    /// Names of every console handed out.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.consoles.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl ConsoleProvider for MemoryConsoleProvider {
    fn console(&self, name: &str) -> Arc<dyn AppConsole> {
        Arc::new(self.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_sink_splits_and_flushes() {
        let console = MemoryConsole::new();
        {
            let mut sink = console.output_stream(LogType::AppOut);
            sink.write_all(b"hello\nwor").unwrap();
            sink.write_all(b"ld\r\npartial").unwrap();
        }
        assert_eq!(
            console.lines_of(LogType::AppOut),
            vec!["hello", "world", "partial"]
        );
    }

    #[test]
    fn test_provider_hands_out_same_console() {
        let provider = MemoryConsoleProvider::new();
        provider.console("demo").write("line", LogType::Stdout);
        provider.console("demo").log_command("ls -l");

        let console = provider.get("demo");
        assert!(console.contains("line"));
        assert_eq!(console.commands(), vec!["ls -l"]);
        assert_eq!(provider.names(), vec!["demo"]);
    }
}
