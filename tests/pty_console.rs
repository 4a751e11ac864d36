#[cfg(unix)]
mod pty_console {
    use parking_lot::Mutex;
    use std::io::{self, Write};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use pibake::cancel::CancelToken;
    use pibake::pty::{Console, LaunchCommand, PtyTransport, Transcript, Transport, TransportError};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn shell(transcript: Transcript, cancel: CancelToken) -> Box<dyn Console> {
        let launch = LaunchCommand::new("sh").env("TERM", "dumb");
        PtyTransport::new()
            .spawn(&launch, transcript, cancel)
            .expect("Failed to spawn sh")
    }

    #[test]
    fn expect_matches_command_output() {
        let mut console = shell(Transcript::discard(), CancelToken::new());
        console.send_line("echo marker-$((40+2))").unwrap();
        console
            .expect("marker-42", Duration::from_secs(10))
            .unwrap();
        console.send_line("exit").unwrap();
        console.expect_eof(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn matched_output_is_consumed() {
        let mut console = shell(Transcript::discard(), CancelToken::new());
        console.send_line("echo once-$((1+1))").unwrap();
        console.expect("once-2", Duration::from_secs(10)).unwrap();

        let err = console
            .expect("once-2", Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }), "{:?}", err);
    }

    #[test]
    fn missing_text_times_out() {
        let mut console = shell(Transcript::discard(), CancelToken::new());
        let started = Instant::now();
        let err = console
            .expect("never-printed-text", Duration::from_millis(400))
            .unwrap_err();

        assert!(matches!(err, TransportError::Timeout { .. }), "{:?}", err);
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(err.waited().unwrap() >= Duration::from_millis(400));
    }

    #[test]
    fn stream_end_fails_pending_expectation() {
        let launch = LaunchCommand::new("sh").args(["-c", "echo bye"]);
        let mut console = PtyTransport::new()
            .spawn(&launch, Transcript::discard(), CancelToken::new())
            .unwrap();

        let err = console
            .expect("not-coming", Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, TransportError::StreamEnded { .. }), "{:?}", err);

        let err = console.send_line("echo late").unwrap_err();
        assert!(matches!(err, TransportError::Closed), "{:?}", err);
    }

    #[test]
    fn output_is_mirrored_to_the_transcript() {
        let sink = SharedBuf::default();
        let mut console = shell(
            Transcript::discard().with_writer(sink.clone()),
            CancelToken::new(),
        );
        console.send_line("echo mirrored-$((2*3))").unwrap();
        console.expect("mirrored-6", Duration::from_secs(10)).unwrap();

        let text = String::from_utf8_lossy(&sink.0.lock()).into_owned();
        assert!(text.contains("mirrored-6"), "{:?}", text);
    }

    #[test]
    fn cancel_interrupts_a_wait() {
        let cancel = CancelToken::new();
        let mut console = shell(Transcript::discard(), cancel.clone());

        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });

        let started = Instant::now();
        let err = console
            .expect("never-printed-text", Duration::from_secs(30))
            .unwrap_err();
        assert!(err.is_cancelled(), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn unbounded_timeout_still_matches_and_cancels() {
        let cancel = CancelToken::new();
        let mut console = shell(Transcript::discard(), cancel.clone());

        console.send_line("echo forever-$((3+4))").unwrap();
        console
            .expect("forever-7", Duration::from_secs(u64::MAX))
            .unwrap();

        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });
        let err = console
            .expect("never-printed-text", Duration::MAX)
            .unwrap_err();
        assert!(err.is_cancelled(), "{:?}", err);
        handle.join().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let mut console = shell(Transcript::discard(), CancelToken::new());
        assert!(console.close().is_some());
        assert!(console.close().is_none());
        assert!(matches!(
            console.send_line("echo after"),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn spawning_a_missing_program_fails() {
        let launch = LaunchCommand::new("/nonexistent/pibake-runtime");
        let result = PtyTransport::new().spawn(&launch, Transcript::discard(), CancelToken::new());
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }
}
