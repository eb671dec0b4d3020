//! Bus monitoring: a 100ms cooperative poll over a pipeline's bus, handling
//! EOS, ERROR, STATE_CHANGED, and LATENCY messages.

use gstreamer as gst;
use gstreamer::prelude::*;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bus events surfaced to the owning session task. The bus watch callback
/// runs on a GStreamer-owned thread; it never blocks, it only sends once
/// into this channel (the "post-once" primitive).
#[derive(Debug, Clone)]
pub enum BusEvent {
    Eos,
    Error(String),
    SourceWentToReady,
    Latency,
}

/// Installs a synchronous bus watch that logs every message and forwards the
/// subset the session cares about. Returns the guard that must be kept alive
/// for as long as the pipeline exists.
pub fn install_bus_watch(pipeline: &gst::Pipeline) -> Option<gst::bus::BusWatchGuard> {
    let bus = pipeline.bus()?;
    bus.add_watch(move |_, msg| {
        use gst::MessageView;
        match msg.view() {
            MessageView::Error(err) => {
                let src = err.src().map(|s| s.path_string()).unwrap_or_else(|| "unknown".into());
                error!(source = %src, error = %err.error(), debug = ?err.debug(), "pipeline error");
            }
            MessageView::Warning(warning) => {
                let src = warning.src().map(|s| s.path_string()).unwrap_or_else(|| "unknown".into());
                warn!(source = %src, warning = %warning.error(), "pipeline warning");
            }
            MessageView::StateChanged(sc) => {
                if sc.src().and_then(|s| s.downcast_ref::<gst::Pipeline>()).is_some() {
                    debug!(old = ?sc.old(), new = ?sc.current(), "pipeline state changed");
                }
            }
            MessageView::Eos(_) => info!("end of stream"),
            MessageView::Latency(_) => debug!("latency message"),
            _ => {}
        }
        gst::glib::ControlFlow::Continue
    })
    .ok()
}

/// Polls both pipelines' buses on a 100ms tick and forwards classified
/// [`BusEvent`]s to `tx`. Runs as a spawned cooperative task, not a blocking
/// loop, per the concurrency model's suspension-point rule.
pub async fn poll_bus_loop(
    video_bus: gst::Bus,
    audio_bus: Option<gst::Bus>,
    tx: mpsc::UnboundedSender<BusEvent>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    loop {
        interval.tick().await;

        for bus in std::iter::once(&video_bus).chain(audio_bus.iter()) {
            while let Some(msg) = bus.pop() {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Eos(_) => {
                        if tx.send(BusEvent::Eos).is_err() {
                            return;
                        }
                    }
                    MessageView::Error(err) => {
                        if tx.send(BusEvent::Error(err.error().to_string())).is_err() {
                            return;
                        }
                    }
                    MessageView::StateChanged(sc) => {
                        let is_source = sc
                            .src()
                            .map(|s| s.name().starts_with("source") || s.name().starts_with("x11"))
                            .unwrap_or(false);
                        if is_source
                            && sc.old() == gst::State::Paused
                            && sc.current() == gst::State::Ready
                            && tx.send(BusEvent::SourceWentToReady).is_err()
                        {
                            return;
                        }
                    }
                    MessageView::Latency(_) => {
                        if tx.send(BusEvent::Latency).is_err() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_event_error_carries_message() {
        let ev = BusEvent::Error("boom".into());
        match ev {
            BusEvent::Error(msg) => assert_eq!(msg, "boom"),
            _ => panic!("expected Error variant"),
        }
    }
}
