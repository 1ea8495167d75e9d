use super::stream::Shared;
use super::UploadError;
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::BoxError;
use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Weak;

/// Source of a request body.
///
/// Every method is called on the request's upload executor, one call at a
/// time. `read` and `rewind` complete through the sink they are handed,
/// either before returning or later from any thread. Returning `Err`
/// instead fails the request the same way reporting an error through the
/// sink does.
pub trait UploadDataProvider: Send + 'static {
    /// Body length in bytes, or `None` for a chunked upload of unknown size.
    fn length(&mut self) -> Result<Option<u64>, BoxError>;

    /// Write the next bytes at `buffer.position()`, then hand the buffer
    /// back with [`UploadDataSink::on_read_succeeded`].
    fn read(&mut self, sink: UploadDataSink, buffer: ByteBuffer) -> Result<(), BoxError>;

    /// Restart the body from its first byte.
    fn rewind(&mut self, sink: RewindSink) -> Result<(), BoxError>;

    /// Called once when the owning request is finished.
    fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Completion handle for one [`UploadDataProvider::read`] call.
///
/// Dropping it without reporting fails the upload. Reporting after the
/// request is gone is a no-op.
pub struct UploadDataSink {
    shared: Weak<Shared>,
    op: u64,
    reported: bool,
}

impl UploadDataSink {
    pub(super) fn new(shared: Weak<Shared>, op: u64) -> Self {
        Self {
            shared,
            op,
            reported: false,
        }
    }

    /// The bytes between the position at call time and `buffer.position()`
    /// are the data read. `final_chunk` ends a chunked upload.
    pub fn on_read_succeeded(mut self, buffer: ByteBuffer, final_chunk: bool) {
        self.reported = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.read_completed(self.op, Ok((buffer, final_chunk)));
        }
    }

    pub fn on_read_error(mut self, err: BoxError) {
        self.reported = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.read_completed(self.op, Err(UploadError::provider(err)));
        }
    }
}

impl Drop for UploadDataSink {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.sink_dropped(self.op, |shared, op| {
                shared.read_completed(op, Err(UploadError::SinkDropped))
            });
        }
    }
}

/// Completion handle for one [`UploadDataProvider::rewind`] call.
pub struct RewindSink {
    shared: Weak<Shared>,
    op: u64,
    reported: bool,
}

impl RewindSink {
    pub(super) fn new(shared: Weak<Shared>, op: u64) -> Self {
        Self {
            shared,
            op,
            reported: false,
        }
    }

    pub fn on_rewind_succeeded(mut self) {
        self.reported = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.rewind_completed(self.op, Ok(()));
        }
    }

    pub fn on_rewind_error(mut self, err: BoxError) {
        self.reported = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.rewind_completed(self.op, Err(UploadError::provider(err)));
        }
    }
}

impl Drop for RewindSink {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.sink_dropped(self.op, |shared, op| {
                shared.rewind_completed(op, Err(UploadError::SinkDropped))
            });
        }
    }
}

/// Ready-made providers.
pub struct UploadDataProviders;

impl UploadDataProviders {
    pub fn from_bytes(data: impl Into<Bytes>) -> Box<dyn UploadDataProvider> {
        Box::new(BytesProvider {
            data: data.into(),
            offset: 0,
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Box<dyn UploadDataProvider> {
        Self::from_bytes(Bytes::from(data))
    }

    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Box<dyn UploadDataProvider>> {
        let file = File::open(path)?;
        Ok(Box::new(FileProvider { file }))
    }
}

struct BytesProvider {
    data: Bytes,
    offset: usize,
}

impl UploadDataProvider for BytesProvider {
    fn length(&mut self) -> Result<Option<u64>, BoxError> {
        Ok(Some(self.data.len() as u64))
    }

    fn read(&mut self, sink: UploadDataSink, mut buffer: ByteBuffer) -> Result<(), BoxError> {
        let n = buffer.put(&self.data[self.offset..]);
        self.offset += n;
        sink.on_read_succeeded(buffer, false);
        Ok(())
    }

    fn rewind(&mut self, sink: RewindSink) -> Result<(), BoxError> {
        self.offset = 0;
        sink.on_rewind_succeeded();
        Ok(())
    }
}

struct FileProvider {
    file: File,
}

impl UploadDataProvider for FileProvider {
    fn length(&mut self) -> Result<Option<u64>, BoxError> {
        Ok(Some(self.file.metadata()?.len()))
    }

    fn read(&mut self, sink: UploadDataSink, mut buffer: ByteBuffer) -> Result<(), BoxError> {
        let mut chunk = vec![0; buffer.remaining()];
        let n = self.file.read(&mut chunk)?;
        buffer.put(&chunk[..n]);
        sink.on_read_succeeded(buffer, false);
        Ok(())
    }

    fn rewind(&mut self, sink: RewindSink) -> Result<(), BoxError> {
        self.file.seek(SeekFrom::Start(0))?;
        sink.on_rewind_succeeded();
        Ok(())
    }
}
