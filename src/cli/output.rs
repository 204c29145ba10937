//! Stdout helpers that treat a closed pipe (`arcstream list x.tar | head`)
//! as a normal end of output.

/// Print with newline; returns `Ok(())` from the caller on BrokenPipe.
macro_rules! print_line {
    ($($arg:tt)*) => {{
        use std::io::Write;
        match writeln!(std::io::stdout(), $($arg)*) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }};
}

pub(crate) use print_line;

/// Copies raw bytes to stdout. `Ok(false)` means the reader went away.
pub fn write_stdout(out: &mut impl std::io::Write, data: &[u8]) -> std::io::Result<bool> {
    match out.write_all(data) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(false),
        Err(e) => Err(e),
    }
}
