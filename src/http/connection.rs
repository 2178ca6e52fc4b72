use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::server::Handler;

pub struct Connection<S> {
    stream: S,
    buffer: Vec<u8>,
    state: ConnectionState,
    handler: Arc<dyn Handler>,
    idle_timeout: Duration,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

enum Incoming {
    Request(Request),
    Malformed(ParseError),
    Eof,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, handler: Arc<dyn Handler>, idle_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            handler,
            idle_timeout,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => match self.read_request().await? {
                    Incoming::Request(req) => {
                        self.state = ConnectionState::Processing(req);
                    }
                    Incoming::Malformed(e) => {
                        debug!(error = ?e, "Rejecting malformed request");
                        let response = match e {
                            ParseError::BodyTooLarge => Response::payload_too_large(),
                            _ => Response::bad_request(),
                        };
                        let writer = ResponseWriter::new(&response, false, true);
                        self.state = ConnectionState::Writing(writer, false);
                    }
                    Incoming::Eof => {
                        self.state = ConnectionState::Closed;
                    }
                },

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let include_body = req.method != Method::HEAD;

                    match self.dispatch(req).await {
                        Some(response) => {
                            let writer = ResponseWriter::new(&response, keep_alive, include_body);
                            self.state = ConnectionState::Writing(writer, keep_alive);
                        }
                        None => {
                            debug!("Client disconnected while request was in flight");
                            self.state = ConnectionState::Closed;
                        }
                    }
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<Incoming> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(Incoming::Request(request));
                }

                Err(ParseError::Incomplete) => {}

                Err(e) => return Ok(Incoming::Malformed(e)),
            }

            let mut temp = [0u8; 4096];
            let n = match tokio::time::timeout(self.idle_timeout, self.stream.read(&mut temp)).await {
                Ok(read) => read?,
                Err(_) => {
                    debug!("Idle connection timed out");
                    return Ok(Incoming::Eof);
                }
            };

            if n == 0 {
                // Client closed connection
                return Ok(Incoming::Eof);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }

    /// Runs the handler while watching the client socket.
    ///
    /// Returns `None` when the client hangs up first; the handler future is
    /// dropped at that point, which aborts any in-flight backend call.
    async fn dispatch(&mut self, req: Request) -> Option<Response> {
        let handler = Arc::clone(&self.handler);
        let handling = handler.handle(req);
        tokio::pin!(handling);

        let mut watching = true;
        loop {
            let mut temp = [0u8; 4096];
            tokio::select! {
                response = &mut handling => return Some(response),
                read = self.stream.read(&mut temp), if watching => match read {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => {
                        // Pipelined bytes belong to the next request.
                        self.buffer.extend_from_slice(&temp[..n]);
                        if self.buffer.len() > crate::http::parser::MAX_HEAD_BYTES {
                            watching = false;
                        }
                    }
                },
            }
        }
    }
}
