/*
 * Copyright (c) 2023 University of Oxford.
 * Copyright (c) 2023 Red Hat, Inc.
 * All rights reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::{
    fs::create_dir_all,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread,
};

use log::*;

pub mod session;
use session::{SessionTable, TransferSession, TransferState};

use crate::config::Timeouts;
use crate::constants::*;
use crate::errors::{MigrationError, MigrationResult};
use crate::lifecycle::RestorePlan;
use crate::protocol::{
    framing::{is_timeout, pb_read_next, pb_write},
    messages::{FileData, Hello},
    Kind, Request, Res, ResultCode,
};
use crate::runtime::ContainerRuntime;

/// State shared by all connection handlers.
pub struct ServerContext {
    pub image_root: PathBuf,
    pub plan: RestorePlan,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub timeouts: Timeouts,
    sessions: Mutex<SessionTable>,
}

impl ServerContext {
    pub fn new(image_root: &Path, plan: RestorePlan, runtime: Arc<dyn ContainerRuntime>, timeouts: Timeouts, max_sessions: usize) -> Self {
        Self {
            image_root: image_root.to_path_buf(),
            plan,
            runtime,
            timeouts,
            sessions: Mutex::new(SessionTable::new(max_sessions)),
        }
    }

    fn open_session(&self, peer: SocketAddr, container_id: &str) -> MigrationResult<u32> {
        let mut sessions = lock(&self.sessions)?;
        let id = sessions.open(peer, container_id)?;
        info!("[{id}] [==] Session opened for {container_id}, {} active", sessions.active());
        Ok(id)
    }

    fn close_session(&self, id: u32) {
        if let Ok(mut sessions) = lock(&self.sessions) {
            if sessions.close(id).is_some() {
                info!("[{id}] [==] Session closed");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MigrationResult<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| MigrationError::Protocol("session table poisoned".to_string()))
}

/// How a connection handler ended.
enum Outcome {
    /// The peer went away or the session failed; keep serving.
    Closed,
    /// A restore ran; the server is done.
    Restored(MigrationResult<i32>),
}

pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl Server {
    /// Bind the transfer service and make sure the image root exists.
    pub fn bind(address: &str, port: u16, context: ServerContext) -> MigrationResult<Self> {
        create_dir_all(&context.image_root)?;

        let server_address = format!("{address}:{port}");
        let listener = TcpListener::bind(&server_address)?;
        info!("[==] Server listening on {}", listener.local_addr()?);

        Ok(Self { listener, context: Arc::new(context) })
    }

    pub fn local_addr(&self) -> MigrationResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve migrations until one of them ran its restore. Returns the
    /// restored container's exit status, which the caller is expected to
    /// exit with.
    pub fn serve(self) -> MigrationResult<i32> {
        let (tx, rx) = mpsc::channel();
        let Server { listener, context } = self;

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let context = Arc::clone(&context);
                        let tx = tx.clone();

                        // Spawn a new thread to handle the client connection.
                        thread::spawn(move || {
                            if let Outcome::Restored(result) = handle_client(stream, &context) {
                                let _ = tx.send(result);
                            }
                        });
                    }
                    Err(e) => {
                        error!("[!!] Failed to accept a connection: {}", e);
                    }
                }
            }
        });

        rx.recv()
            .map_err(|_| MigrationError::Protocol("listener stopped".to_string()))?
    }
}

fn send_res(tcp_stream: &mut TcpStream, res: &Res) -> MigrationResult<()> {
    let code = res.result_code();
    if code.is_success() {
        info!("[{}] [<<] {}: {}", res.session_id, code.as_str_name(), res.message);
    } else {
        warn!("[{}] [<<] {}: {}", res.session_id, code.as_str_name(), res.message);
    }
    pb_write(tcp_stream, res)?;
    Ok(())
}

fn error_res(error: &MigrationError, session_id: u32) -> Res {
    let message = match error {
        MigrationError::Remote { message, .. } => message.clone(),
        other => other.to_string(),
    };
    Res::new(error.result_code(), message, session_id)
}

/// Reads the next request, `None` once the peer has gone.
fn next_request(tcp_stream: &mut TcpStream, peer: SocketAddr, session_id: u32) -> Option<Request> {
    match pb_read_next::<_, Request>(tcp_stream) {
        Ok(Some((request, _))) => Some(request),
        Ok(None) => {
            info!("[{session_id}] [==] {peer} disconnected");
            None
        }
        Err(e) if is_timeout(&e) => {
            error!("[{session_id}] [!!] {peer} idle for too long, dropping session");
            None
        }
        Err(e) => {
            error!("[{session_id}] [!!] Failed to read from {peer}: {e}");
            let _ = pb_write(tcp_stream, &error_res(&e, session_id));
            None
        }
    }
}

fn handle_client(mut tcp_stream: TcpStream, context: &ServerContext) -> Outcome {
    let peer = match tcp_stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            error!("[!!] Connection without peer address: {e}");
            return Outcome::Closed;
        }
    };
    info!("[==] New client connected: {peer}");

    // Liveness bound between two frames of the peer.
    if let Err(e) = tcp_stream.set_read_timeout(Some(context.timeouts.progress)) {
        error!("[!!] Failed to set read timeout for {peer}: {e}");
        return Outcome::Closed;
    }
    let _ = tcp_stream.set_write_timeout(Some(context.timeouts.rpc));

    let mut session = match open_session(&mut tcp_stream, peer, context) {
        Some(session) => session,
        None => {
            let _ = tcp_stream.shutdown(Shutdown::Both);
            return Outcome::Closed;
        }
    };

    let outcome = run_session(&mut tcp_stream, peer, &mut session, context);

    context.close_session(session.id());
    let _ = tcp_stream.shutdown(Shutdown::Both);
    outcome
}

/// The first frame must be a `Hello`; anything else ends the connection.
fn open_session(tcp_stream: &mut TcpStream, peer: SocketAddr, context: &ServerContext) -> Option<TransferSession> {
    let request = next_request(tcp_stream, peer, 0)?;

    let hello: Hello = match request.kind {
        Some(Kind::Hello(hello)) => hello,
        other => {
            let name = other.as_ref().map(|k| k.name()).unwrap_or("empty request");
            let res = Res::new(ResultCode::OutOfOrder, format!("expected Hello, got {name}"), 0);
            let _ = send_res(tcp_stream, &res);
            return None;
        }
    };
    info!("[==] [>>] Hello from {peer}: container {}, protocol {}", hello.container_id, hello.protocol_version);

    if hello.protocol_version != PROTOCOL_VERSION {
        let res = Res::new(
            ResultCode::InvalidArgument,
            format!("protocol version {} not supported, expected {}", hello.protocol_version, PROTOCOL_VERSION),
            0,
        );
        let _ = send_res(tcp_stream, &res);
        return None;
    }

    match context.open_session(peer, &hello.container_id) {
        Ok(id) => {
            let session = TransferSession::new(id, &context.plan.container_id, &context.image_root);
            send_res(tcp_stream, &Res::new(ResultCode::Ok, MESSAGE_SUCCESS, id)).ok()?;
            Some(session)
        }
        Err(e) => {
            let _ = send_res(tcp_stream, &error_res(&e, 0));
            None
        }
    }
}

fn run_session(tcp_stream: &mut TcpStream, peer: SocketAddr, session: &mut TransferSession, context: &ServerContext) -> Outcome {
    let id = session.id();

    while let Some(request) = next_request(tcp_stream, peer, id) {
        if request.session_id != id {
            let res = Res::new(
                ResultCode::SessionMismatch,
                format!("request for session {} on session {}", request.session_id, id),
                id,
            );
            let _ = send_res(tcp_stream, &res);
            continue;
        }

        let kind = match request.kind {
            Some(kind) => kind,
            None => {
                let _ = send_res(tcp_stream, &Res::new(ResultCode::Protocol, "empty request", id));
                continue;
            }
        };

        // Only a stream opened by `FileData` can leave chunks behind on the wire.
        let streaming = matches!(kind, Kind::Data(_));
        let result = match kind {
            Kind::Hello(_) => Err(MigrationError::Remote {
                code: ResultCode::OutOfOrder,
                message: "session already open".to_string(),
            }),
            Kind::Folder(info) => session
                .announce_folder(&info)
                .map(|_| Res::new(ResultCode::Ok, MESSAGE_SUCCESS, id)),
            Kind::File(info) => session
                .announce_file(&info)
                .map(|_| Res::new(ResultCode::Ok, MESSAGE_SUCCESS, id)),
            Kind::Data(chunk) => receive_stream(tcp_stream, session, chunk)
                .map(|size| Res::new(ResultCode::Ok, format!("{MESSAGE_FILE_DONE} ({size} bytes)"), id)),
            Kind::DataEnd(end) => session
                .finish_file(&end)
                .map(|size| Res::new(ResultCode::Ok, format!("{MESSAGE_FILE_DONE} ({size} bytes)"), id)),
            Kind::Restore(info) => match session.begin_restore(&info) {
                Ok(images_dir) => {
                    let result = restore(tcp_stream, session, &images_dir, context);
                    session.finish();
                    return Outcome::Restored(result);
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(res) => {
                if let Err(e) = send_res(tcp_stream, &res) {
                    error!("[{id}] [!!] Failed to reply to {peer}: {e}");
                    return Outcome::Closed;
                }
            }
            Err(e) => {
                let _ = send_res(tcp_stream, &error_res(&e, id));
                if streaming {
                    error!("[{id}] [!!] File stream aborted, closing session");
                    return Outcome::Closed;
                }
            }
        }
    }

    if session.state() != TransferState::Finished {
        if let Some(folder) = session.folder() {
            warn!(
                "[{id}] [!!] Session ended before restore, {} left with {} files ({} bytes)",
                folder.display(), session.files_received(), session.bytes_received()
            );
        }
    }
    Outcome::Closed
}

/// Consumes one client-streamed file transfer: `first` is the chunk that
/// opened the stream, more chunks follow until `FileDataEnd`.
fn receive_stream(tcp_stream: &mut TcpStream, session: &mut TransferSession, first: FileData) -> MigrationResult<u64> {
    let id = session.id();
    session.write_chunk(&first)?;

    loop {
        let request: Request = match pb_read_next(tcp_stream)? {
            Some((request, _)) => request,
            None => return Err(MigrationError::ChannelClosed),
        };
        if request.session_id != id {
            return Err(MigrationError::Remote {
                code: ResultCode::SessionMismatch,
                message: format!("chunk for session {} on session {}", request.session_id, id),
            });
        }

        match request.kind {
            Some(Kind::Data(chunk)) => session.write_chunk(&chunk)?,
            Some(Kind::DataEnd(end)) => return session.finish_file(&end),
            other => {
                let name = other.as_ref().map(|k| k.name()).unwrap_or("empty request");
                return Err(MigrationError::Remote {
                    code: ResultCode::OutOfOrder,
                    message: format!("{name} inside a file data stream"),
                });
            }
        }
    }
}

/// Acknowledges the trigger, runs the restore, and reports its result
/// before the server goes away.
fn restore(tcp_stream: &mut TcpStream, session: &TransferSession, images_dir: &Path, context: &ServerContext) -> MigrationResult<i32> {
    let id = session.id();
    send_res(tcp_stream, &Res::new(ResultCode::Accepted, MESSAGE_RESTORE_ACCEPTED, id))?;

    info!(
        "[{id}] [==] Restoring {} from {} ({} files, {} bytes)",
        session.container_id(), images_dir.display(), session.files_received(), session.bytes_received()
    );
    let result = context.plan.execute(context.runtime.as_ref(), images_dir);

    let res = match &result {
        Ok(status) => {
            info!("[{id}] [==] Container {} exited with status {status}", session.container_id());
            Res::restored(*status, MESSAGE_RESTORE_DONE, id)
        }
        Err(e) => {
            error!("[{id}] [!!] Restore failed: {e}");
            Res::new(ResultCode::RestoreFailed, e.to_string(), id)
        }
    };

    // The peer may have stopped waiting; the exit status still counts.
    if let Err(e) = send_res(tcp_stream, &res) {
        warn!("[{id}] [!!] Could not report restore result: {e}");
    }
    result
}
