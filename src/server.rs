// GelSense HILS - Synchronization Server
//
// Thread layout:
//   accept   : one thread, spawns a session per connection
//   hub      : one thread, sole writer of the touch state
//   rx-/tx-  : reader + writer per session

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::Config;
use crate::error::Result;
use crate::simulation::{Noise, SimulationEngine};
use crate::tasks::hub::{self, HubCommand};
use crate::tasks::session::{self, SessionContext};

pub struct HilsServer {
    listener: TcpListener,
    ctx: SessionContext,
    hub_rx: mpsc::Receiver<HubCommand>,
}

impl HilsServer {
    pub fn bind(config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(config.server.address())?;
        let (hub_tx, hub_rx) = mpsc::channel();

        let sim = &config.simulation;
        let noise = if sim.noise {
            Noise::Gaussian {
                relative_std: sim.noise_level,
            }
        } else {
            Noise::Disabled
        };

        log::info!(
            "HILS server listening on {} (noise {:?}, {} pairs)",
            listener.local_addr()?,
            noise,
            config.inference.pairs.len()
        );
        Ok(Self {
            listener,
            ctx: SessionContext {
                hub: hub_tx,
                shared: hub::shared_state(),
                engine: Arc::new(SimulationEngine::new(sim)),
                noise,
                pairs: Arc::new(config.inference.pairs.clone()),
            },
            hub_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `stop` is set.  The flag is checked after each accept.
    pub fn run(self, stop: Arc<AtomicBool>) -> Result<()> {
        let Self {
            listener,
            ctx,
            hub_rx,
        } = self;

        let hub_shared = Arc::clone(&ctx.shared);
        thread::Builder::new()
            .name("hub".into())
            .spawn(move || hub::hub_task(hub_rx, hub_shared))?;

        let mut accepted: u64 = 0;
        for stream in listener.incoming() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("set_nodelay: {}", e);
            }
            accepted += 1;
            let session_ctx = ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("rx-{accepted}"))
                .spawn(move || session::session_task(stream, session_ctx));
            if let Err(e) = spawned {
                log::error!("Cannot spawn session thread: {}", e);
            }
        }

        log::info!("HILS server stopped after {} connection(s)", accepted);
        Ok(())
    }

    /// Run on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("accept".into())
            .spawn(move || {
                if let Err(e) = self.run(flag) {
                    log::error!("HILS server failed: {}", e);
                }
            })?;
        Ok(ServerHandle {
            addr,
            stop,
            join: Some(join),
        })
    }
}

pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting.  Open sessions run until their clients leave.
    pub fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.stop.store(true, Ordering::Relaxed);
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.addr);
        let _ = join.join();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
