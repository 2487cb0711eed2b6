// Copyright 2020 Joyent, Inc.

//! Client side of the protocol.
//!
//! A [`Client`] owns one connection. Any number of calls may be awaited
//! concurrently on it; each takes a `CancellationToken`, and cancelling it
//! abandons the call both locally and on the server.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use slog::{debug, o, warn, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::correlator::{Correlator, Ticket};
use crate::error::{Error, Fault, Result};
use crate::messages::{
    validate_identifier, Answer, AnswerBody, DirectoryEntry, FileInfo, Request, Source,
};
use crate::methods::CallMethodDescriptor;
use crate::protocol::{Message, MessageCodec, MessageStatus, RequestId};
use crate::transfer::{ContentTransport, FileUrlTransport};

type DescriptorCache = HashMap<(String, String), Arc<CallMethodDescriptor>>;

pub struct Client {
    correlator: Arc<Correlator>,
    pub(crate) config: ClientConfig,
    descriptors: Mutex<DescriptorCache>,
    pub(crate) content: Arc<dyn ContentTransport>,
    reader: JoinHandle<()>,
    pub(crate) log: Logger,
}

impl Client {
    pub async fn connect(addr: &SocketAddr, config: ClientConfig, log: Option<&Logger>) -> Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Client::from_stream(stream, config, log))
    }

    /// Wrap an established connection. Must be called within a runtime.
    pub fn from_stream(stream: TcpStream, config: ClientConfig, log: Option<&Logger>) -> Client {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::from("unknown"));
        let log = crate::default_logger(log).new(o!("component" => "client", "peer" => peer));

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Correlator::new(tx, log.clone()));

        spawn_writer(
            FramedWrite::new(write_half, MessageCodec::new(config.max_frame_size)),
            rx,
            Arc::downgrade(&correlator),
            log.clone(),
        );
        let reader = spawn_reader(
            FramedRead::new(read_half, MessageCodec::new(config.max_frame_size)),
            Arc::downgrade(&correlator),
            log.clone(),
        );

        Client {
            correlator,
            config,
            descriptors: Mutex::new(HashMap::new()),
            content: Arc::new(FileUrlTransport),
            reader,
            log,
        }
    }

    /// Replace the transport used for storage-source content URLs.
    pub fn with_content_transport(mut self, content: Arc<dyn ContentTransport>) -> Client {
        self.content = content;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.correlator.is_connected()
    }

    /// Enqueue a request and return at once with its ticket.
    pub fn send(&self, request: &Request) -> Result<Ticket> {
        self.correlator.send(request)
    }

    /// Wait for the answer to a previously sent request.
    pub async fn await_answer(&self, ticket: Ticket, cancel: &CancellationToken) -> Result<AnswerBody> {
        let answer = self.correlator.await_answer(ticket, cancel).await?;
        answer.into_result().map_err(Error::from)
    }

    /// Send a cancellation notice for `id`.
    pub fn cancel_request(&self, id: RequestId) -> Result<()> {
        self.correlator.cancel(id)
    }

    pub async fn call(&self, request: &Request, cancel: &CancellationToken) -> Result<AnswerBody> {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let ticket = self.send(request)?;
        self.await_answer(ticket, cancel).await
    }

    pub async fn save_strings(&self, entries: Vec<(String, String)>, cancel: &CancellationToken) -> Result<()> {
        let request = Request::SaveStrings { entries };
        expect_done(&request, self.call(&request, cancel).await?)
    }

    /// Values for `keys`, in order; unknown keys load as empty strings.
    pub async fn load_strings(&self, keys: Vec<String>, cancel: &CancellationToken) -> Result<Vec<String>> {
        let count = keys.len();
        let request = Request::LoadStrings { keys };
        match self.call(&request, cancel).await? {
            AnswerBody::Strings { values } => check_len(&request, count, values),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Metadata for each path, in order. Missing files are reported with a
    /// negative size rather than as an error.
    pub async fn files_info(
        &self,
        source: Source,
        paths: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileInfo>> {
        let count = paths.len();
        let request = Request::GetFilesInfo {
            source,
            paths,
            any_data: self.config.any_data.clone(),
        };
        match self.call(&request, cancel).await? {
            AnswerBody::FilesInfo { files } => check_len(&request, count, files),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn directory_info(
        &self,
        source: Source,
        path: &str,
        pattern: &str,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<DirectoryEntry>> {
        let request = Request::GetDirectoryInfo {
            source,
            path: String::from(path),
            pattern: String::from(pattern),
            recursive,
            any_data: self.config.any_data.clone(),
        };
        match self.call(&request, cancel).await? {
            AnswerBody::DirectoryInfo { entries } => Ok(entries),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn create_directory(&self, source: Source, path: &str, cancel: &CancellationToken) -> Result<()> {
        let request = Request::CreateDirectory {
            source,
            path: String::from(path),
            any_data: self.config.any_data.clone(),
        };
        expect_done(&request, self.call(&request, cancel).await?)
    }

    pub async fn delete_files(&self, source: Source, paths: Vec<String>, cancel: &CancellationToken) -> Result<()> {
        let request = Request::DeleteFiles {
            source,
            paths,
            any_data: self.config.any_data.clone(),
        };
        expect_done(&request, self.call(&request, cancel).await?)
    }

    pub async fn delete_directory(
        &self,
        source: Source,
        path: &str,
        recursive: bool,
        clear: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = Request::DeleteDirectory {
            source,
            path: String::from(path),
            recursive,
            clear,
            any_data: self.config.any_data.clone(),
        };
        expect_done(&request, self.call(&request, cancel).await?)
    }

    /// One-time URLs for streaming `paths` outside the chunking protocol.
    pub async fn content_urls(
        &self,
        source: Source,
        paths: Vec<String>,
        upload: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let count = paths.len();
        let request = Request::GetContentUrls {
            source,
            paths,
            upload,
            any_data: self.config.any_data.clone(),
        };
        match self.call(&request, cancel).await? {
            AnswerBody::ContentUrls { urls } => check_len(&request, count, urls),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn descriptors(&self) -> MutexGuard<'_, DescriptorCache> {
        self.descriptors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Descriptor for `class_name.method_name`, fetched once and cached.
    pub async fn method_descriptor(
        &self,
        class_name: &str,
        method_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<CallMethodDescriptor>> {
        validate_identifier(class_name)?;
        validate_identifier(method_name)?;
        let key = (String::from(class_name), String::from(method_name));
        if let Some(descriptor) = self.descriptors().get(&key) {
            return Ok(Arc::clone(descriptor));
        }

        let request = Request::GetCallMethod {
            class_name: key.0.clone(),
            method_name: key.1.clone(),
        };
        let text = match self.call(&request, cancel).await? {
            AnswerBody::Text { text } => text,
            other => return Err(unexpected(&request, &other)),
        };
        let descriptor: Arc<CallMethodDescriptor> = Arc::new(serde_json::from_str(&text)?);
        debug!(self.log, "cached method descriptor";
            "method" => format!("{}.{}", class_name, method_name), "id" => descriptor.id);
        Ok(Arc::clone(
            self.descriptors().entry(key).or_insert(descriptor),
        ))
    }

    /// The server's catalog: class name to method descriptors.
    pub async fn call_methods(
        &self,
        commands_only: bool,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, Vec<CallMethodDescriptor>>> {
        let request = Request::GetCallMethods { commands_only };
        match self.call(&request, cancel).await? {
            AnswerBody::Text { text } => Ok(serde_json::from_str(&text)?),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Call a method with already-marshalled arguments.
    pub async fn call_method_by_id(
        &self,
        method_id: u32,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        let request = Request::CallMethod {
            method_id,
            role: self.config.role,
            arg_count: args.len(),
            args,
        };
        match self.call(&request, cancel).await? {
            AnswerBody::MethodResult {
                method_id: answered,
                value,
            } if answered == method_id => Ok(value),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Call `class_name.method_name` with caller-level arguments, returning
    /// its caller-level result (`None` for void methods).
    pub async fn call_method_value(
        &self,
        class_name: &str,
        method_name: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        let descriptor = self.method_descriptor(class_name, method_name, cancel).await?;
        let wire_args = descriptor.encode_args(args).map_err(Error::Validation)?;
        let wire = self.call_method_by_id(descriptor.id, wire_args, cancel).await?;

        match (&descriptor.output, wire) {
            (None, _) => Ok(None),
            (Some(output), Some(wire)) => output.decode(&wire).map(Some).map_err(Error::Protocol),
            (Some(_), None) => Err(Error::Protocol(format!(
                "{}.{} answered without a return value",
                class_name, method_name
            ))),
        }
    }

    /// Like `call_method_value`, deserializing the result into `T`.
    /// Structure results deserialize field by field from their names.
    pub async fn call_method<T: DeserializeOwned>(
        &self,
        class_name: &str,
        method_name: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let value = self
            .call_method_value(class_name, method_name, args, cancel)
            .await?
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
        self.correlator.connection_lost("client closed");
    }
}

fn spawn_writer(
    mut sink: FramedWrite<tokio::net::tcp::OwnedWriteHalf, MessageCodec>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    correlator: Weak<Correlator>,
    log: Logger,
) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!(log, "failed to write request"; "err" => %e);
                if let Some(correlator) = correlator.upgrade() {
                    correlator.connection_lost(&e.to_string());
                }
                break;
            }
        }
    });
}

fn spawn_reader(
    mut stream: FramedRead<tokio::net::tcp::OwnedReadHalf, MessageCodec>,
    correlator: Weak<Correlator>,
    log: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => break e.to_string(),
                None => break String::from("connection closed by server"),
            };
            if msg.status != MessageStatus::Answer {
                warn!(log, "ignoring unexpected message";
                    "request_id" => msg.id, "name" => msg.name());
                continue;
            }

            let id = msg.id;
            let answer = serde_json::from_value::<Answer>(msg.data.d).unwrap_or_else(|e| {
                Answer::from_result(Err(Fault::protocol(format!("undecodable answer: {}", e))))
            });
            match correlator.upgrade() {
                Some(correlator) => {
                    correlator.deliver(id, answer);
                }
                None => break String::from("client dropped"),
            }
        };

        debug!(log, "reader stopped"; "reason" => %reason);
        if let Some(correlator) = correlator.upgrade() {
            correlator.connection_lost(&reason);
        }
    })
}

fn check_len<T>(request: &Request, expected: usize, items: Vec<T>) -> Result<Vec<T>> {
    if items.len() != expected {
        return Err(Error::Protocol(format!(
            "{} answered {} items for {} requested",
            request.name(),
            items.len(),
            expected
        )));
    }
    Ok(items)
}

fn expect_done(request: &Request, body: AnswerBody) -> Result<()> {
    match body {
        AnswerBody::Done => Ok(()),
        other => Err(unexpected(request, &other)),
    }
}

pub(crate) fn unexpected(request: &Request, body: &AnswerBody) -> Error {
    Error::Protocol(format!(
        "unexpected {} answer to {}",
        body.kind(),
        request.name()
    ))
}
