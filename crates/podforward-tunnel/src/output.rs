//! Per-tunnel diagnostic sinks

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

type Sink = Arc<Mutex<dyn Write + Send>>;

/// Where a forwarding session writes its per-connection diagnostics.
///
/// `out` receives progress lines ("Forwarding from ...", "Handling connection
/// for ..."), `err` receives non-fatal forwarding errors.
#[derive(Clone)]
pub struct Output {
    out: Sink,
    err: Sink,
}

impl Output {
    pub fn new<O, E>(out: O, err: E) -> Self
    where
        O: Write + Send + 'static,
        E: Write + Send + 'static,
    {
        Self {
            out: Arc::new(Mutex::new(out)),
            err: Arc::new(Mutex::new(err)),
        }
    }

    /// Process stdout and stderr
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    pub fn discard() -> Self {
        Self::new(io::sink(), io::sink())
    }

    pub fn line(&self, args: fmt::Arguments<'_>) {
        write_line(&self.out, args);
    }

    pub fn error_line(&self, args: fmt::Arguments<'_>) {
        write_line(&self.err, args);
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::stdio()
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output").finish_non_exhaustive()
    }
}

fn write_line(sink: &Sink, args: fmt::Arguments<'_>) {
    let Ok(mut writer) = sink.lock() else {
        return;
    };
    if let Err(e) = writer.write_fmt(format_args!("{}\n", args)) {
        tracing::debug!("Failed to write diagnostic line: {}", e);
        return;
    }
    let _ = writer.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_lines_go_to_their_sink() {
        let out = Buffer::default();
        let err = Buffer::default();
        let output = Output::new(out.clone(), err.clone());

        output.line(format_args!("Forwarding from 127.0.0.1:{} -> {}", 9090, 8080));
        output.error_line(format_args!("boom"));

        assert_eq!(out.contents(), "Forwarding from 127.0.0.1:9090 -> 8080\n");
        assert_eq!(err.contents(), "boom\n");
    }

    #[test]
    fn test_clones_share_sinks() {
        let out = Buffer::default();
        let output = Output::new(out.clone(), io::sink());
        let clone = output.clone();

        output.line(format_args!("one"));
        clone.line(format_args!("two"));

        assert_eq!(out.contents(), "one\ntwo\n");
    }
}
