//! Background thread running the compositing passes.

use super::OverlayCompositor;
use crate::provider::MapProvider;
use std::{
    sync::{
        Arc,
        mpsc::{RecvTimeoutError, Sender, channel},
    },
    thread::JoinHandle,
};

/// Runs compositing passes whenever there is something in the queue and the foreground is not
/// busy repainting. Stops when dropped.
pub struct OverlayWorker<P: MapProvider> {
    compositor: Arc<OverlayCompositor<P>>,
    join_handle: Option<JoinHandle<()>>,
    quit_tx: Sender<()>,
}

impl<P: MapProvider> OverlayWorker<P> {
    pub fn spawn(compositor: Arc<OverlayCompositor<P>>) -> std::io::Result<Self> {
        let (quit_tx, quit_rx) = channel();
        let worker_compositor = Arc::clone(&compositor);

        let join_handle = std::thread::Builder::new()
            .name("tileweave-overlay".to_owned())
            .spawn(move || {
                let compositor = worker_compositor;
                loop {
                    match quit_rx.recv_timeout(compositor.poll_interval()) {
                        Err(RecvTimeoutError::Timeout) => {
                            if compositor.should_run_pass() {
                                compositor.run_pass();
                            }
                        }
                        // Either asked to quit, or the worker handle is gone.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("Overlay worker finished.");
            })?;

        Ok(Self {
            compositor,
            join_handle: Some(join_handle),
            quit_tx,
        })
    }

    pub fn compositor(&self) -> &Arc<OverlayCompositor<P>> {
        &self.compositor
    }

    /// Foreground is repainting. Passes are held off until it calms down.
    pub fn notify_repaint_requested(&self) {
        self.compositor.repaint_requested();
    }
}

impl<P: MapProvider> Drop for OverlayWorker<P> {
    fn drop(&mut self) {
        self.compositor.cancel();
        let _ = self.quit_tx.send(());

        if let Some(join_handle) = self.join_handle.take() {
            log::debug!("Waiting for the overlay worker to exit.");
            if join_handle.join().is_err() {
                log::warn!("Overlay worker panicked.");
            }
        }
    }
}
