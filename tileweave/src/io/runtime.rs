//! Thread running the Tokio runtime of the tile loads.

pub struct Runtime {
    join_handle: Option<std::thread::JoinHandle<()>>,
    quit_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl Runtime {
    pub fn new<F>(name: &str, f: F) -> std::io::Result<Self>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send,
    {
        let (quit_tx, mut quit_rx) = tokio::sync::mpsc::unbounded_channel();

        // Built on the calling thread, so the error reaches the caller.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let join_handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                runtime.spawn(f);
                runtime.block_on(quit_rx.recv());
            })?;

        Ok(Self {
            join_handle: Some(join_handle),
            quit_tx,
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Fails only if the thread is gone already.
        let _ = self.quit_tx.send(());

        if let Some(join_handle) = self.join_handle.take() {
            log::debug!("Waiting for the IO thread to exit.");
            if join_handle.join().is_err() {
                log::error!("IO thread panicked.");
            }
        }

        log::debug!("IO thread is down.");
    }
}
