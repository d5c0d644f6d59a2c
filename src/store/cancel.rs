use std::io::{self, Read, Write};

use tokio_util::sync::CancellationToken;

const COPY_CHUNK: usize = 32 * 1024;

/// Chunked copy that stops at the next chunk boundary once `cancel` fires.
/// Returns `Interrupted` on cancellation so callers can tell it apart.
pub fn copy_with_cancel(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    cancel: &CancellationToken,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }

        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        writer.write_all(&buf[..read])?;
        total += read as u64;
    }

    writer.flush()?;
    Ok(total)
}
