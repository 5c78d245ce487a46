// GelSense HILS - Inference Task
//
// Calibrates once, then measures and classifies every `period` until the
// cancel flag is raised.  Transient faults drop the tick and the loop tries
// again on the next one; they never surface as decisions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::drivers::ImpedanceSource;
use crate::error::Error;
use crate::events::InferenceEvent;
use crate::session::InferenceSession;

/// Runs until cancelled, the event receiver goes away, or a fatal error.
/// Hands the stopped session back to the caller.
pub fn inference_task<S: ImpedanceSource>(
    mut session: InferenceSession<S>,
    events: Sender<InferenceEvent>,
    cancel: Arc<AtomicBool>,
    period: Duration,
) -> InferenceSession<S> {
    log::info!("Inference task started (period {:?})", period);

    // ---- calibration ------------------------------------------------------
    loop {
        if cancel.load(Ordering::Relaxed) {
            session.stop();
            return session;
        }
        match session.calibrate() {
            Ok(adjusted) => {
                let event = InferenceEvent::calibrated(adjusted);
                if events.send(event).is_err() {
                    log::warn!("Event channel closed, exiting inference task");
                    session.stop();
                    return session;
                }
                break;
            }
            Err(e) => {
                let retrying =
                    e.is_transient() || matches!(e, Error::CalibrationInstability { .. });
                if retrying {
                    log::warn!("Calibration failed, retrying: {}", e);
                } else {
                    log::error!("Calibration failed: {}", e);
                }
                let delivered = events
                    .send(InferenceEvent::calibration_failed(&e, retrying))
                    .is_ok();
                if !(retrying && delivered) {
                    session.stop();
                    return session;
                }
                thread::sleep(period);
            }
        }
    }

    // ---- measurement loop -------------------------------------------------
    while !cancel.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        let event = match session.step() {
            Ok(decision) => InferenceEvent::Decision {
                seq: session.seq(),
                decision,
            },
            Err(e @ Error::ModelIncompatibility(_)) => {
                log::error!("Stopping inference: {}", e);
                break;
            }
            Err(e) => {
                log::warn!("Measurement {} dropped: {}", session.seq(), e);
                InferenceEvent::MeasurementDropped {
                    seq: session.seq(),
                    reason: e.to_string(),
                }
            }
        };
        if events.send(event).is_err() {
            log::warn!("Event channel closed, exiting inference task");
            break;
        }

        let elapsed = tick_start.elapsed();
        if elapsed < period {
            thread::sleep(period - elapsed);
        }
    }

    session.stop();
    session
}
