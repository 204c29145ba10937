//! External filter programs. The command's stdin and stdout are pipes; a
//! helper thread pumps one side so neither end can deadlock on a full
//! pipe.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::io::sink::SinkWriter;
use crate::io::stream::{DecodeStream, Layer};

/// Splits a command line into argv with shell-like quoting, without
/// running a shell.
pub(crate) fn split_command(command: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(Error::open(format!("Unterminated quote in `{command}`"))),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(Error::open(format!("Unterminated quote in `{command}`"))),
                        },
                        Some(c) => current.push(c),
                        None => return Err(Error::open(format!("Unterminated quote in `{command}`"))),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    current.push(c);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    if args.is_empty() {
        return Err(Error::open("Invalid external program: empty command"));
    }
    Ok(args)
}

fn spawn(command: &str) -> Result<Child> {
    let argv = split_command(command)?;
    log::debug!("spawning filter program {argv:?}");
    Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::open_io(format!("Can't launch external program `{command}`"), e))
}

fn missing_pipe() -> Error {
    Error::open("Failed to open pipe to external program")
}

fn check_exit(command: &str, child: &mut Child) -> io::Result<()> {
    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("external program `{command}` failed: {status}")))
    }
}

/// Decoding side: archive bytes are fed to the program, its output is the
/// next layer up.
pub(crate) struct ProgramReader {
    command: String,
    child: Child,
    stdout: ChildStdout,
    feeder: Option<JoinHandle<io::Result<()>>>,
    finished: bool,
}

impl ProgramReader {
    pub(crate) fn spawn(command: &str, mut input: DecodeStream) -> Result<Self> {
        let mut child = spawn(command)?;
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            child.kill().ok();
            return Err(missing_pipe());
        };

        let feeder = thread::spawn(move || {
            match io::copy(&mut input, &mut stdin) {
                Ok(_) => Ok(()),
                // The program may stop reading early; that is its call.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(e),
            }
        });

        Ok(ProgramReader {
            command: command.to_string(),
            child,
            stdout,
            feeder: Some(feeder),
            finished: false,
        })
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        if let Some(feeder) = self.feeder.take() {
            feeder
                .join()
                .map_err(|_| io::Error::other("filter feeder thread panicked"))??;
        }
        check_exit(&self.command, &mut self.child)
    }
}

impl Read for ProgramReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finish()?;
        }
        Ok(n)
    }
}

impl Layer for ProgramReader {}

impl Drop for ProgramReader {
    fn drop(&mut self) {
        if !self.finished {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

/// Encoding side: the writer pushes into the program's stdin and a pump
/// thread moves its output into the sink.
pub(crate) struct ProgramWriter {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    pump: Option<JoinHandle<io::Result<SinkWriter>>>,
}

impl ProgramWriter {
    pub(crate) fn spawn(command: &str, mut sink: SinkWriter) -> Result<Self> {
        let mut child = spawn(command)?;
        let (Some(stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            child.kill().ok();
            return Err(missing_pipe());
        };
        let pump = thread::spawn(move || {
            io::copy(&mut stdout, &mut sink)?;
            Ok(sink)
        });
        Ok(ProgramWriter {
            command: command.to_string(),
            child,
            stdin: Some(stdin),
            pump: Some(pump),
        })
    }

    /// Closes the program's input, waits for it, and hands back the sink.
    pub(crate) fn finish(mut self) -> io::Result<SinkWriter> {
        drop(self.stdin.take());
        let sink = match self.pump.take() {
            Some(pump) => pump
                .join()
                .map_err(|_| io::Error::other("filter output thread panicked"))??,
            None => return Err(io::Error::other("filter output already collected")),
        };
        check_exit(&self.command, &mut self.child)?;
        Ok(sink)
    }

    fn stdin(&mut self) -> io::Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "filter input closed"))
    }
}

impl Write for ProgramWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdin()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin()?.flush()
    }
}

impl Drop for ProgramWriter {
    fn drop(&mut self) {
        if self.pump.is_some() {
            drop(self.stdin.take());
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}
