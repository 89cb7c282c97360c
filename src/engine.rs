use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::Error;
use crate::events::{GeneratedEvent, InputBatch};
use crate::inference::{Flush, ForwardPass, InferenceDriver};
use crate::session::GenerationSession;

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Input(InputBatch),
    /// Clears the context; the next input starts a fresh epoch.
    Reset,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    Generated(Vec<GeneratedEvent>),
    CacheFlushed(Flush),
    Error { message: String },
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    pub thread: JoinHandle<()>,
}

/// Moves the session and driver onto the compute thread. `tick_counter`
/// is the live tick published by the I/O loop.
pub fn spawn_engine<M>(
    session: GenerationSession<M::Cache>,
    driver: InferenceDriver<M>,
    tick_counter: Arc<AtomicU64>,
    idle: Duration,
) -> EngineHandle
where
    M: ForwardPass + Send + 'static,
    M::Cache: Send,
{
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let thread = std::thread::spawn(move || {
        engine_thread(session, driver, tick_counter, idle, command_rx, update_tx);
    });

    EngineHandle {
        command_tx,
        update_rx,
        thread,
    }
}

struct EngineState<M: ForwardPass> {
    session: GenerationSession<M::Cache>,
    driver: InferenceDriver<M>,
    update_tx: Sender<EngineUpdate>,
}

impl<M: ForwardPass> EngineState<M> {
    /// Returns false on shutdown.
    fn handle(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Input(batch) => {
                let report = self.driver.ingest(&mut self.session, &batch);
                tracing::trace!(appended = report.appended, "live input ingested");
                self.publish(report.flushes, report.errors);
            }
            EngineCommand::Reset => {
                self.session.reset();
                tracing::info!("context reset");
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    fn publish(&self, flushes: Vec<Flush>, errors: Vec<Error>) {
        for flush in flushes {
            let _ = self.update_tx.send(EngineUpdate::CacheFlushed(flush));
        }
        for error in errors {
            if let Error::LatencyBudgetExceeded { elapsed, budget } = error {
                tracing::debug!(?elapsed, ?budget, "step skipped over budget");
                continue;
            }
            let _ = self.update_tx.send(EngineUpdate::Error {
                message: error.to_string(),
            });
        }
    }
}

fn engine_thread<M: ForwardPass>(
    session: GenerationSession<M::Cache>,
    driver: InferenceDriver<M>,
    tick_counter: Arc<AtomicU64>,
    idle: Duration,
    command_rx: Receiver<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    let mut state = EngineState {
        session,
        driver,
        update_tx,
    };

    loop {
        match command_rx.recv_timeout(idle) {
            Ok(command) => {
                if !state.handle(command) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // live input always goes in before anything is generated
        let mut running = true;
        while let Ok(command) = command_rx.try_recv() {
            if !state.handle(command) {
                running = false;
                break;
            }
        }
        if !running {
            break;
        }

        let live_tick = tick_counter.load(Ordering::Relaxed);
        let report = state
            .driver
            .generate(&mut state.session, &command_rx, live_tick);
        if report.interrupted {
            tracing::trace!(steps = report.steps, "generation yielded to live input");
        }
        if !report.events.is_empty() {
            let _ = state.update_tx.send(EngineUpdate::Generated(report.events));
        }
        state.publish(report.flushes, report.errors);
    }

    tracing::info!(epoch = state.session.window.epoch(), "engine stopped");
}
