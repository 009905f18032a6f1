#[cfg(test)]
mod server_test;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use arc_swap::ArcSwap;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use crate::config::Config;
use crate::control::StreamStore;
use crate::error::Result;
use crate::pusher::Pusher;
use crate::record::RecordService;
use crate::session::Session;

pub type PusherMap = HashMap<String, Arc<dyn Pusher>>;

pub type PusherHookFuture = Pin<Box<dyn Future<Output = Option<Arc<dyn Pusher>>> + Send>>;

/// Hook consulted by [`Server::get_pusher`]; may synthesize a replacement
/// pusher (the VOD subsystem registers one).
pub type GetPusherHook = Arc<
    dyn Fn(Arc<Server>, Option<Arc<Session>>, String, Option<Arc<dyn Pusher>>) -> PusherHookFuture
        + Send
        + Sync,
>;

enum RegistryCommand {
    Add {
        pusher: Arc<dyn Pusher>,
        close_old: bool,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<bool>,
    },
}

/// The RTSP server: TCP accept loop plus the pusher registry.
///
/// Registry mutations flow through a command mailbox consumed by a single
/// task, which makes close-old replacement atomic with the start of the
/// new broadcast loop. After every mutation the task republishes an
/// immutable path→pusher snapshot; lookups never take a lock.
pub struct Server {
    config: Arc<Config>,
    pushers: ArcSwap<PusherMap>,
    cmd_tx: mpsc::Sender<RegistryCommand>,
    cmd_rx: Mutex<Option<mpsc::Receiver<RegistryCommand>>>,
    hooks: StdMutex<Vec<GetPusherHook>>,
    record: Option<Arc<RecordService>>,
    streams: StreamStore,
    stopped: AtomicBool,
    stop_notify: Notify,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl Server {
    /// Build the server and its subsystems. Recording (and with it VOD)
    /// comes up only when storage paths are configured; a configured but
    /// unusable storage layout is a startup error.
    pub async fn new(config: Arc<Config>) -> Result<Arc<Server>> {
        let record = if config.record.storage_paths.is_empty() {
            None
        } else {
            Some(RecordService::start(Arc::clone(&config)).await?)
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let server = Arc::new(Server {
            config,
            pushers: ArcSwap::from_pointee(PusherMap::new()),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            hooks: StdMutex::new(Vec::new()),
            record,
            streams: StreamStore::default(),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            local_addr: StdMutex::new(None),
        });

        if server.record.is_some() {
            crate::vod::register_hook(&server);
        }
        if let Some(path) = &server.config.streams_file {
            server.streams.open(path.into())?;
        }

        Ok(server)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn record(&self) -> Option<&Arc<RecordService>> {
        self.record.as_ref()
    }

    pub fn streams(&self) -> &StreamStore {
        &self.streams
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Bind the configured port and serve until stopped.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.config.rtsp.port)).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        *self.local_addr.lock().unwrap() = Some(listener.local_addr()?);
        self.spawn_registry().await;
        log::info!("rtsp server start on [{}]", listener.local_addr()?);

        // Re-establish persisted pull streams off the accept path.
        let restore = Arc::clone(self);
        tokio::spawn(async move {
            crate::control::restore_streams(&restore).await;
        });

        while !self.is_stopped() {
            let accepted = tokio::select! {
                _ = self.stop_notify.notified() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, _addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    if !self.is_stopped() {
                        log::error!("rtsp server listen fail: [{err}]");
                    }
                    continue;
                }
            };
            self.accept(stream);
        }
        Ok(())
    }

    fn accept(self: &Arc<Self>, stream: TcpStream) {
        let network_buffer = self.config.rtsp.network_buffer;
        {
            let sock = SockRef::from(&stream);
            if let Err(err) = sock.set_recv_buffer_size(network_buffer) {
                log::error!("rtsp server conn set read buffer error, {err}");
            }
            if let Err(err) = sock.set_send_buffer_size(network_buffer) {
                log::error!("rtsp server conn set write buffer error, {err}");
            }
        }
        match Session::new(Arc::clone(self), stream, Arc::clone(&self.config)) {
            Ok(session) => {
                log::info!("{session} connected");
                tokio::spawn(session.start());
            }
            Err(err) => log::error!("session setup failed: {err}"),
        }
    }

    async fn spawn_registry(self: &Arc<Self>) {
        let mut cmd_rx = match self.cmd_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut pushers = PusherMap::new();
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    RegistryCommand::Add {
                        pusher,
                        close_old,
                        reply,
                    } => {
                        let path = pusher.path();
                        let old = pushers.get(&path).cloned();
                        let added = match (&old, close_old) {
                            (None, _) => true,
                            (Some(_), true) => true,
                            (Some(_), false) => false,
                        };
                        if added {
                            pushers.insert(path.clone(), Arc::clone(&pusher));
                            server.pushers.store(Arc::new(pushers.clone()));
                            if let Some(old) = old {
                                log::info!("pusher[{}] replaces old on {path}", pusher.id());
                                tokio::spawn(async move { old.stop().await });
                            } else {
                                log::info!(
                                    "pusher[{}] start, now pusher size[{}]",
                                    pusher.id(),
                                    pushers.len()
                                );
                            }
                            tokio::spawn(pusher.start());
                        }
                        let _ = reply.send(added);
                    }
                    RegistryCommand::Remove { id, reply } => {
                        let path = pushers
                            .iter()
                            .find(|(_, pusher)| pusher.id() == id)
                            .map(|(path, _)| path.clone());
                        let removed = match path {
                            Some(path) => {
                                let pusher = pushers.remove(&path);
                                server.pushers.store(Arc::new(pushers.clone()));
                                log::info!(
                                    "pusher[{id}] end, now pusher size[{}]",
                                    pushers.len()
                                );
                                if let Some(pusher) = pusher {
                                    tokio::spawn(async move { pusher.stop().await });
                                }
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(removed);
                    }
                }
            }
        });
    }

    /// Install a pusher at its path. Returns false when the path is taken
    /// and `close_old` is not set; with `close_old` the previous pusher is
    /// stopped asynchronously and replaced.
    pub async fn add_pusher(&self, pusher: Arc<dyn Pusher>, close_old: bool) -> bool {
        let (reply, answer) = oneshot::channel();
        if self
            .cmd_tx
            .send(RegistryCommand::Add {
                pusher,
                close_old,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    /// Remove by id (identity-checked) and stop the removed pusher.
    pub async fn remove_pusher(&self, id: &str) -> bool {
        let (reply, answer) = oneshot::channel();
        if self
            .cmd_tx
            .send(RegistryCommand::Remove {
                id: id.to_owned(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    pub fn register_get_pusher_hook(&self, hook: GetPusherHook) {
        self.hooks.lock().unwrap().push(hook);
    }

    /// Look up the pusher at `path`, giving every registered hook a chance
    /// to substitute one (this is how `/vod/...` paths materialize).
    pub async fn get_pusher(
        self: &Arc<Self>,
        path: &str,
        session: Option<Arc<Session>>,
    ) -> Option<Arc<dyn Pusher>> {
        let mut pusher = self.pushers.load().get(path).cloned();
        let hooks: Vec<GetPusherHook> = self.hooks.lock().unwrap().clone();
        for hook in hooks {
            pusher = hook(
                Arc::clone(self),
                session.clone(),
                path.to_owned(),
                pusher,
            )
            .await;
        }
        pusher
    }

    /// Wait-free snapshot of the registry.
    pub fn pushers(&self) -> Arc<PusherMap> {
        self.pushers.load_full()
    }

    pub fn pusher_count(&self) -> usize {
        self.pushers.load().len()
    }

    /// Stop accepting, then stop every pusher.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_one();
        let pushers = self.pushers.load_full();
        for pusher in pushers.values() {
            pusher.stop().await;
        }
        log::info!("rtsp server stopped");
    }
}
