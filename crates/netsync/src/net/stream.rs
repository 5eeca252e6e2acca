use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::error::ConnectionError;
use super::frame::{Frame, FrameCodec};

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

pub(crate) fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY: {e}");
    }
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, FrameCodec::new()),
        FramedWrite::new(write_half, FrameCodec::new()),
    )
}

pub(crate) async fn write_frame(
    writer: &mut FrameWriter,
    frame: Frame,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    match tokio::time::timeout(timeout, writer.send(frame)).await {
        Ok(result) => result.map_err(classify),
        Err(_) => Err(ConnectionError::WriteTimeout(timeout)),
    }
}

/// Folds the socket errors that mean "peer went away" into `Reset`.
pub(crate) fn classify(error: ConnectionError) -> ConnectionError {
    match error {
        ConnectionError::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) =>
        {
            ConnectionError::Reset
        }
        other => other,
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
