// Copyright 2020 Joyent, Inc.

//! Server side of the protocol.
//!
//! Each accepted connection gets one reader loop. Every request frame is
//! handled on its own task so a slow operation never holds up other
//! requests on the same channel; answers are funnelled back through a
//! single writer task per connection.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::cancel::{CancellationRegistry, RequestScope};
use crate::config::ServerConfig;
use crate::error::Fault;
use crate::messages::{Answer, AnswerBody, Limits, Request, CANCEL_NOTICE};
use crate::methods::{CallContext, MethodRegistry};
use crate::policy::{AccessPolicy, AllowAll, CallerInfo};
use crate::protocol::{Message, MessageCodec, MessageStatus};
use crate::storage::{FileStore, MemoryStringStore, StringStore};

pub struct Server {
    config: ServerConfig,
    limits: Limits,
    strings: Arc<dyn StringStore>,
    files: Arc<dyn FileStore>,
    methods: Arc<MethodRegistry>,
    policy: Arc<dyn AccessPolicy>,
    cancellations: Arc<CancellationRegistry>,
    next_conn: AtomicU64,
    shutdown: CancellationToken,
    log: Logger,
}

impl Server {
    pub fn new(config: ServerConfig, files: Arc<dyn FileStore>, log: Option<&Logger>) -> Server {
        let log = crate::default_logger(log).new(o!("component" => "server"));
        Server {
            limits: config.limits(),
            cancellations: Arc::new(CancellationRegistry::new(config.cancel_retention())),
            config,
            strings: Arc::new(MemoryStringStore::new()),
            files,
            methods: Arc::new(MethodRegistry::new()),
            policy: Arc::new(AllowAll),
            next_conn: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            log,
        }
    }

    pub fn with_string_store(mut self, strings: Arc<dyn StringStore>) -> Server {
        self.strings = strings;
        self
    }

    pub fn with_methods(mut self, methods: MethodRegistry) -> Server {
        self.methods = Arc::new(methods);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Server {
        self.policy = policy;
        self
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    /// Stop accepting connections and close the ones being served.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until `shutdown` is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(self.log, "listening for requests"; "address" => %addr);
        }
        let sweeper = self.cancellations.spawn_sweeper(
            self.config.sweep_interval(),
            self.shutdown.clone(),
            &self.log,
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.make_task(socket, Some(peer)).await;
                    });
                }
                Err(e) => error!(self.log, "failed to accept socket"; "err" => %e),
            }
        }

        if let Err(e) = sweeper.await {
            error!(self.log, "cancellation sweeper failed"; "err" => %e);
        }
        info!(self.log, "server stopped");
        Ok(())
    }

    /// Serve one connection until the peer goes away or the server shuts
    /// down.
    pub async fn make_task(self: Arc<Self>, socket: TcpStream, peer: Option<SocketAddr>) {
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let log = self.log.new(o!("conn" => conn));
        debug!(log, "connection accepted"; "peer" => ?peer);

        let (read_half, write_half) = socket.into_split();
        let mut reader = FramedRead::new(read_half, MessageCodec::new(self.config.max_frame_size));
        let mut writer = FramedWrite::new(write_half, MessageCodec::new(self.config.max_frame_size));

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let disconnected = CancellationToken::new();
        {
            let disconnected = disconnected.clone();
            let log = log.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = writer.send(msg).await {
                        warn!(log, "failed to write answer"; "err" => %e);
                        disconnected.cancel();
                        break;
                    }
                }
            });
        }

        let caller = CallerInfo {
            connection: conn,
            peer,
        };
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = disconnected.cancelled() => break,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(msg)) => self.dispatch(msg, &caller, &tx, &disconnected, &log),
                Some(Err(e)) => {
                    warn!(log, "failed to decode frame"; "err" => %e);
                    break;
                }
                None => break,
            }
        }

        disconnected.cancel();
        self.cancellations.forget_connection(conn);
        info!(log, "connection closed");
    }

    fn dispatch(
        self: &Arc<Self>,
        msg: Message,
        caller: &CallerInfo,
        tx: &mpsc::UnboundedSender<Message>,
        disconnected: &CancellationToken,
        log: &Logger,
    ) {
        match msg.status {
            MessageStatus::Notice if msg.name() == CANCEL_NOTICE => {
                debug!(log, "cancel notice received"; "request_id" => msg.id);
                self.cancellations.mark_cancelled(caller.connection, msg.id);
            }
            MessageStatus::Notice | MessageStatus::Answer => {
                warn!(log, "ignoring unexpected message";
                    "request_id" => msg.id, "name" => msg.name());
            }
            MessageStatus::Request => {
                let id = msg.id;
                let name = String::from(msg.name());
                let log = log.new(o!("request_id" => id, "op" => name.clone()));
                let scope = RequestScope::new(
                    caller.connection,
                    id,
                    Arc::clone(&self.cancellations),
                    disconnected.clone(),
                );
                let server = Arc::clone(self);
                let caller = caller.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let result = match serde_json::from_value::<Request>(msg.data.d) {
                        Ok(request) => server.handle(&caller, &scope, request).await,
                        Err(e) => Err(Fault::validation(format!("malformed {} request: {}", name, e))),
                    };

                    if scope.should_stop() {
                        scope.finish();
                        debug!(log, "request abandoned");
                        return;
                    }
                    scope.finish();

                    if let Err(fault) = &result {
                        debug!(log, "request failed"; "kind" => ?fault.kind, "err" => %fault.message);
                    }
                    match serde_json::to_value(&Answer::from_result(result)) {
                        Ok(d) => {
                            if tx.send(Message::answer(id, &name, d)).is_err() {
                                debug!(log, "connection closed before answer");
                            }
                        }
                        Err(e) => error!(log, "failed to encode answer"; "err" => %e),
                    }
                });
            }
        }
    }

    async fn handle(
        self: &Arc<Self>,
        caller: &CallerInfo,
        scope: &RequestScope,
        request: Request,
    ) -> Result<AnswerBody, Fault> {
        request.validate(&self.limits)?;
        self.policy
            .check(caller, &request)
            .map_err(Fault::unauthorized)?;

        let files = Arc::clone(&self.files);
        match request {
            Request::SaveStrings { entries } => {
                let strings = Arc::clone(&self.strings);
                blocking(move || strings.save(&entries)).await?;
                Ok(AnswerBody::Done)
            }
            Request::LoadStrings { keys } => {
                let strings = Arc::clone(&self.strings);
                let values = blocking(move || strings.load(&keys)).await?;
                Ok(AnswerBody::Strings { values })
            }
            Request::GetFilesInfo { source, paths, .. } => {
                let files = blocking(move || files.files_info(source, &paths)).await?;
                Ok(AnswerBody::FilesInfo { files })
            }
            Request::GetDirectoryInfo {
                source,
                path,
                pattern,
                recursive,
                ..
            } => {
                let scope = scope.clone();
                let entries = blocking(move || {
                    files.directory_info(source, &path, &pattern, recursive, &|| scope.should_stop())
                })
                .await?;
                Ok(AnswerBody::DirectoryInfo { entries })
            }
            Request::DownloadContent { source, parts, .. } => {
                let scope = scope.clone();
                let blocks = blocking(move || {
                    let mut blocks = Vec::with_capacity(parts.len());
                    for part in &parts {
                        if scope.should_stop() {
                            return Err(Fault::canceled());
                        }
                        blocks.push(files.read_range(source, part)?);
                    }
                    Ok(blocks)
                })
                .await?;
                Ok(AnswerBody::Content { blocks })
            }
            Request::UploadContent { source, parts, .. } => {
                let scope = scope.clone();
                blocking(move || {
                    for part in &parts {
                        if scope.should_stop() {
                            return Err(Fault::canceled());
                        }
                        files.write_range(source, &part.range(), &part.bytes)?;
                    }
                    Ok(())
                })
                .await?;
                Ok(AnswerBody::Done)
            }
            Request::CreateDirectory { source, path, .. } => {
                blocking(move || files.create_directory(source, &path)).await?;
                Ok(AnswerBody::Done)
            }
            Request::DeleteFiles { source, paths, .. } => {
                blocking(move || files.delete_files(source, &paths)).await?;
                Ok(AnswerBody::Done)
            }
            Request::DeleteDirectory {
                source,
                path,
                recursive,
                clear,
                ..
            } => {
                blocking(move || files.delete_directory(source, &path, recursive, clear)).await?;
                Ok(AnswerBody::Done)
            }
            Request::GetContentUrls {
                source,
                paths,
                upload,
                ..
            } => {
                let urls = blocking(move || {
                    paths
                        .iter()
                        .map(|p| files.content_url(source, p, upload))
                        .collect::<Result<Vec<String>, Fault>>()
                })
                .await?;
                Ok(AnswerBody::ContentUrls { urls })
            }
            Request::GetCallMethod {
                class_name,
                method_name,
            } => {
                let descriptor = self
                    .methods
                    .descriptor(&class_name, &method_name)
                    .ok_or_else(|| {
                        Fault::not_found(format!("no method {}.{}", class_name, method_name))
                    })?;
                let text = serde_json::to_string(&*descriptor)
                    .map_err(|e| Fault::backend(e.to_string()))?;
                Ok(AnswerBody::Text { text })
            }
            Request::GetCallMethods { commands_only } => {
                let text = serde_json::to_string(&self.methods.catalog(commands_only))
                    .map_err(|e| Fault::backend(e.to_string()))?;
                Ok(AnswerBody::Text { text })
            }
            Request::CallMethod {
                method_id,
                role,
                args,
                ..
            } => {
                let method = self
                    .methods
                    .get(method_id)
                    .ok_or_else(|| Fault::not_found(format!("no method with id {}", method_id)))?;
                let ctx = CallContext {
                    request_id: scope.id,
                    role,
                    scope: scope.clone(),
                };
                let value = tokio::select! {
                    value = method.invoke(ctx, &args) => value?,
                    _ = scope.disconnected() => return Err(Fault::canceled()),
                };
                Ok(AnswerBody::MethodResult { method_id, value })
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, Fault>
where
    F: FnOnce() -> Result<T, Fault> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Fault::backend(format!("storage task failed: {}", e)))?
}
