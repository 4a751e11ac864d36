use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Raw copy of everything the console prints, for post-hoc diagnosis.
///
/// Sink failures are logged once and otherwise ignored; a broken
/// transcript never fails a session.
#[derive(Default)]
pub struct Transcript {
    sinks: Vec<Box<dyn Write + Send>>,
    failed: bool,
}

impl Transcript {
    /// A transcript that records nothing.
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn stdout() -> Self {
        Self::discard().with_writer(io::stdout())
    }

    pub fn with_writer<W: Write + Send + 'static>(mut self, writer: W) -> Self {
        self.sinks.push(Box::new(writer));
        self
    }

    /// Append a file sink, truncating any previous transcript at `path`.
    pub fn with_file(self, path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(self.with_writer(file))
    }

    pub fn mirror(&mut self, bytes: &[u8]) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.write_all(bytes).and_then(|_| sink.flush()) {
                if !self.failed {
                    tracing::warn!("Transcript sink write failed: {}", e);
                    self.failed = true;
                }
            }
        }
    }

    /// Write a marker line that is not console output.
    pub fn note(&mut self, message: &str) {
        self.mirror(format!("\n! {}\n", message).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Spy(Arc<Mutex<Vec<u8>>>);

    impl Write for Spy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn mirror_fans_out_to_every_sink() {
        let a = Spy::default();
        let b = Spy::default();
        let mut transcript = Transcript::discard()
            .with_writer(a.clone())
            .with_writer(b.clone());

        transcript.mirror(b"login: ");
        assert_eq!(a.0.lock().as_slice(), b"login: ");
        assert_eq!(b.0.lock().as_slice(), b"login: ");
    }

    #[test]
    fn file_sink_receives_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let mut transcript = Transcript::discard().with_file(&path).unwrap();
        transcript.mirror(b"Raspbian GNU/Linux 10");
        transcript.note("Stopping container");
        drop(transcript);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Raspbian GNU/Linux 10"));
        assert!(text.contains("! Stopping container"));
    }
}
