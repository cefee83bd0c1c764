//! Client facade wiring session, pipeline and output together

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::audio::buffer::{pipeline, PipelineOptions};
use crate::audio::device::Sink;
use crate::audio::output::{OutputDriver, OutputHandle, OutputStage};
use crate::audio::volume::VolumeControl;
use crate::codec::{DecoderRegistry, SharedRegistry};
use crate::config::{ClientConfig, ProcessingMode};
use crate::error::{Error, Result};
use crate::network::{SessionHandles, SessionState, SnapSession};
use crate::sync::{ClockModel, SharedClock, SystemClock, TimeSync};

type SessionOutcome = (SnapSession, Result<()>);

struct Running {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<SessionOutcome>>,
    /// Set once the task was awaited by `wait`
    finished: Option<std::result::Result<SessionOutcome, JoinError>>,
    output: Option<OutputHandle>,
}

/// A Snapcast client.
///
/// `begin` starts the session task (and the output thread in threaded mode);
/// `end` stops both and empties the pipeline. The sink is kept across
/// restarts.
pub struct SnapClient {
    config: ClientConfig,
    handles: SessionHandles,
    sink: Option<Box<dyn Sink>>,
    running: Option<Running>,
}

impl SnapClient {
    pub fn new(config: ClientConfig, sink: Box<dyn Sink>) -> Result<Self> {
        Self::with_parts(
            config,
            sink,
            Arc::new(SystemClock::new()),
            Arc::new(DecoderRegistry::with_defaults()),
        )
    }

    /// Build with an explicit clock and decoder set
    pub fn with_parts(
        config: ClientConfig,
        sink: Box<dyn Sink>,
        clock: SharedClock,
        registry: SharedRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let handles = SessionHandles {
            clock,
            clock_model: Arc::new(RwLock::new(ClockModel::new())),
            time_sync: Arc::new(Mutex::new(TimeSync::new(&config.sync))),
            volume: Arc::new(VolumeControl::new(config.output.volume_factor)),
            registry,
        };
        Ok(Self {
            config,
            handles,
            sink: Some(sink),
            running: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handles(&self) -> &SessionHandles {
        &self.handles
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn state(&self) -> SessionState {
        match &self.running {
            Some(running) => *running.state.borrow(),
            None => SessionState::Disconnected,
        }
    }

    /// Start streaming. Must be called within a tokio runtime.
    pub fn begin(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Config("client already running".into()));
        }
        let sink = self
            .sink
            .take()
            .ok_or_else(|| Error::Config("no audio sink".into()))?;

        let (writer, reader) = pipeline(PipelineOptions::from(&self.config.buffer));
        let stage = OutputStage::new(
            self.handles.registry.clone(),
            sink,
            self.handles.clock.clone(),
            self.handles.clock_model.clone(),
            self.handles.time_sync.clone(),
            self.handles.volume.clone(),
        );
        let driver = OutputDriver::new(reader, stage, self.config.buffer.pop_timeout());

        let (output, cooperative) = match self.config.mode {
            ProcessingMode::Threaded => (Some(driver.spawn()?), None),
            ProcessingMode::Cooperative => (None, Some(driver)),
        };

        let mut session = SnapSession::new(
            self.config.clone(),
            self.handles.clone(),
            writer,
            cooperative,
        );
        let state = session.subscribe();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let result = session.run(shutdown_rx).await;
            (session, result)
        });

        tracing::info!(
            "Client started ({:?} mode, {} byte pipeline)",
            self.config.mode,
            self.config.buffer.capacity()
        );
        self.running = Some(Running {
            shutdown,
            state,
            task: Some(task),
            finished: None,
            output,
        });
        Ok(())
    }

    /// Resolve once the session stops on its own after a fatal error.
    ///
    /// Cancel safe; `end` must still be called afterwards and reports the
    /// error.
    pub async fn wait(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if let Some(task) = running.task.as_mut() {
            let joined = task.await;
            running.task = None;
            running.finished = Some(joined);
        }
    }

    /// Stop the session and the output, then empty the pipeline.
    ///
    /// Returns the error that stopped the session, if any.
    pub async fn end(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        running.shutdown.send_replace(true);

        let joined = match (running.finished.take(), running.task.take()) {
            (Some(finished), _) => finished,
            (None, Some(task)) => task.await,
            (None, None) => return Err(Error::Config("session task lost".into())),
        };
        let (mut session, result) = joined.map_err(join_error)?;

        let driver = match (running.output.take(), session.take_driver()) {
            (Some(output), _) => tokio::task::spawn_blocking(move || output.stop())
                .await
                .map_err(join_error)??,
            (None, Some(driver)) => driver,
            (None, None) => return Err(Error::Config("output driver lost".into())),
        };
        drop(session);

        let (mut reader, stage) = driver.into_parts();
        reader.clear();
        self.sink = Some(stage.into_sink());
        tracing::info!("Client stopped");
        result
    }
}

fn join_error(e: JoinError) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::NullSink;

    fn config(mode: ProcessingMode) -> ClientConfig {
        let mut config = ClientConfig {
            mode,
            ..Default::default()
        };
        // nothing listens here
        config.server.port = 9;
        config.server.connect_timeout_ms = 50;
        config.server.reconnect_backoff_ms = 10;
        config
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(ProcessingMode::Threaded);
        bad.buffer.activation_percent = 0;
        assert!(matches!(
            SnapClient::new(bad, Box::new(NullSink::new())),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_end_threaded() {
        let mut client =
            SnapClient::new(config(ProcessingMode::Threaded), Box::new(NullSink::new())).unwrap();
        client.begin().unwrap();
        assert!(client.is_running());
        assert!(client.begin().is_err());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        client.end().await.unwrap();
        assert!(!client.is_running());
        assert_eq!(client.state(), SessionState::Disconnected);

        // sink was handed back, so the client can start again
        client.begin().unwrap();
        client.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_end_cooperative() {
        let mut client =
            SnapClient::new(config(ProcessingMode::Cooperative), Box::new(NullSink::new()))
                .unwrap();
        client.begin().unwrap();
        client.end().await.unwrap();
        assert!(!client.is_running());
    }
}
