// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP intake for octet-counted RFC 5424 records.
//!
//! Each accepted connection gets its own task that reassembles frames and
//! files every parsed record with the [`Aggregator`]. A frame that fails to
//! parse is skipped; a framing error ends that connection only.

use std::net::SocketAddr;
use std::sync::Arc;

use syslog_record::rfc5424;
use syslog_record::rfc6587::{FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::aggregator::Aggregator;
use crate::errors::IntakeError;

const READ_BUFFER_SIZE: usize = 8192;

pub struct IntakeServer {
    listener: TcpListener,
    aggregator: Arc<Aggregator>,
    cancel_token: CancellationToken,
    max_frame_len: usize,
}

impl IntakeServer {
    pub async fn bind(
        addr: &str,
        aggregator: Arc<Aggregator>,
        cancel_token: CancellationToken,
    ) -> Result<Self, IntakeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| IntakeError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            aggregator,
            cancel_token,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IntakeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the cancel token fires.
    pub async fn spin(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "log intake listening");
        }
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = self.cancel_token.cancelled() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted log connection");
                    let aggregator = Arc::clone(&self.aggregator);
                    let cancel_token = self.cancel_token.clone();
                    let max_frame_len = self.max_frame_len;
                    tokio::spawn(
                        async move {
                            if let Err(e) =
                                consume(stream, &aggregator, &cancel_token, max_frame_len).await
                            {
                                error!("log connection failed: {e}");
                            }
                        }
                        .instrument(info_span!("intake_connection", %peer)),
                    );
                }
                Err(e) => warn!("failed to accept log connection: {e}"),
            }
        }
        info!("log intake stopped");
    }
}

async fn consume(
    mut stream: TcpStream,
    aggregator: &Aggregator,
    cancel_token: &CancellationToken,
    max_frame_len: usize,
) -> Result<(), IntakeError> {
    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut buf = [0; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            read = stream.read(&mut buf) => read?,
            () = cancel_token.cancelled() => return Ok(()),
        };
        if read == 0 {
            if decoder.buffered() > 0 {
                warn!(
                    bytes = decoder.buffered(),
                    "log connection closed mid-frame"
                );
            }
            return Ok(());
        }
        decoder.extend(&buf[..read]);
        while let Some(frame) = decoder.next_frame()? {
            match rfc5424::parse(&frame) {
                Ok(record) => aggregator.feed(record),
                Err(e) => warn!("dropping malformed log record: {e}"),
            }
        }
    }
}
