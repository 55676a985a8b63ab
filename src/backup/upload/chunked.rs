use crate::backup::pipeline::progress::human_size;
use crate::backup::pipeline::{Sink, StreamReader};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::{MultipartUpload, RemoteId, RemoteStore, UploadDescriptor};
use std::io::Read;

/// Multipart upload fed directly from the stream.
///
/// One chunk is always held back: a full chunk is sent only once the next
/// read proves more data follows, and the final chunk is sent at commit.
/// A truncated stream therefore can never complete an upload.
pub struct ChunkedSink<'a> {
    store: &'a dyn RemoteStore,
    descriptor: UploadDescriptor,
    chunk_size: usize,
    upload: Option<Box<dyn MultipartUpload + 'a>>,
    pending: Option<Vec<u8>>,
    parts_sent: u32,
}

impl<'a> ChunkedSink<'a> {
    pub fn new(store: &'a dyn RemoteStore, descriptor: UploadDescriptor, chunk_size: usize) -> Self {
        Self {
            store,
            descriptor,
            chunk_size: chunk_size.max(1),
            upload: None,
            pending: None,
            parts_sent: 0,
        }
    }

    fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let mut upload = match self.upload.take() {
            Some(upload) => upload,
            None => {
                tracing::info!(
                    "Starting multipart upload of {:?}",
                    self.descriptor.object_name()
                );
                self.store.create_multipart(&self.descriptor)?
            }
        };
        let part_number = self.parts_sent + 1;
        let sent = upload.upload_part(part_number, chunk);
        self.upload = Some(upload);
        sent?;
        self.parts_sent = part_number;
        tracing::info!("Sent part {} ({})", part_number, human_size(chunk.len() as u64));
        Ok(())
    }

    fn abort(upload: Option<Box<dyn MultipartUpload + 'a>>) {
        if let Some(upload) = upload {
            tracing::info!("Aborting multipart upload");
            if let Err(e) = upload.abort() {
                tracing::warn!("Failed to abort multipart upload: {}", e);
            }
        }
    }

    fn finish(&mut self) -> Result<RemoteId> {
        let last = self.pending.take().unwrap_or_default();
        if !last.is_empty() || self.parts_sent == 0 {
            self.send(&last)?;
        }
        match self.upload.take() {
            Some(upload) => upload.complete(),
            None => Err(Error::Upload("multipart upload was never started".into())),
        }
    }
}

/// Fills `buf` with up to `limit` bytes, stopping early only at end of stream.
pub fn read_chunk<R: Read>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<()> {
    buf.clear();
    reader.take(limit as u64).read_to_end(buf)?;
    Ok(())
}

impl Sink for ChunkedSink<'_> {
    type Output = RemoteId;

    fn consume(&mut self, input: &mut StreamReader) -> Result<()> {
        loop {
            let mut chunk = Vec::with_capacity(self.chunk_size);
            read_chunk(input, &mut chunk, self.chunk_size)?;
            if let Some(previous) = self.pending.take() {
                self.send(&previous)?;
            }
            let at_end = chunk.len() < self.chunk_size;
            self.pending = Some(chunk);
            if at_end {
                return Ok(());
            }
        }
    }

    fn commit(mut self) -> Result<RemoteId> {
        let result = self.finish();
        if result.is_err() {
            Self::abort(self.upload.take());
        } else {
            tracing::info!("Completed multipart upload in {} parts", self.parts_sent);
        }
        result
    }

    fn abandon(mut self) {
        Self::abort(self.upload.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::pipeline::{Pipeline, TaskStage};
    use crate::backup::upload::tests::FakeStore;
    use std::io::Write;

    const CHUNK: usize = 1000;

    fn descriptor() -> UploadDescriptor {
        UploadDescriptor::builder()
            .description("2024-01-01_00:00 vm1")
            .object_name("2024-01-01_0000_vm1.tar.gpg")
            .build()
    }

    fn producer(len: usize) -> TaskStage {
        TaskStage::new("producer", move |_, mut out| {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            out.write_all(&data)?;
            Ok(())
        })
    }

    #[test]
    fn test_read_chunk_fills_until_limit_or_eof() {
        let data = vec![1u8; 2500];
        let mut reader = data.as_slice();
        let mut buf = Vec::new();
        read_chunk(&mut reader, &mut buf, CHUNK).unwrap();
        assert_eq!(buf.len(), CHUNK);
        read_chunk(&mut reader, &mut buf, CHUNK).unwrap();
        assert_eq!(buf.len(), CHUNK);
        read_chunk(&mut reader, &mut buf, CHUNK).unwrap();
        assert_eq!(buf.len(), 500);
        read_chunk(&mut reader, &mut buf, CHUNK).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parts_in_order_with_short_last_part() {
        let store = FakeStore::default();
        let sink = ChunkedSink::new(&store, descriptor(), CHUNK);

        let id = Pipeline::new(producer(2500)).run(sink).unwrap();

        assert_eq!(id, RemoteId::from("multipart-1"));
        let log = store.log.lock().unwrap();
        assert_eq!(log.parts, vec![(1, 1000), (2, 1000), (3, 500)]);
        let expected: Vec<u8> = (0..2500).map(|i| (i % 251) as u8).collect();
        assert_eq!(log.data, expected);
        assert!(log.completed);
        assert!(!log.aborted);
    }

    #[test]
    fn test_exact_multiple_sends_no_empty_part() {
        let store = FakeStore::default();
        let sink = ChunkedSink::new(&store, descriptor(), CHUNK);

        Pipeline::new(producer(3000)).run(sink).unwrap();

        let log = store.log.lock().unwrap();
        assert_eq!(log.parts, vec![(1, 1000), (2, 1000), (3, 1000)]);
        assert!(log.completed);
    }

    #[test]
    fn test_empty_stream_sends_single_empty_part() {
        let store = FakeStore::default();
        let sink = ChunkedSink::new(&store, descriptor(), CHUNK);

        Pipeline::new(producer(0)).run(sink).unwrap();

        let log = store.log.lock().unwrap();
        assert_eq!(log.parts, vec![(1, 0)]);
        assert!(log.completed);
    }

    #[test]
    fn test_failure_after_two_of_three_parts_aborts() {
        let store = FakeStore {
            fail_part: Some(3),
            ..FakeStore::default()
        };
        let sink = ChunkedSink::new(&store, descriptor(), CHUNK);

        let err = Pipeline::new(producer(2500)).run(sink).unwrap_err();

        assert!(matches!(err.primary(), Error::Upload(_)));
        let log = store.log.lock().unwrap();
        assert_eq!(log.parts.len(), 2);
        assert!(log.aborted);
        assert!(!log.completed);
    }

    #[test]
    fn test_failure_mid_stream_aborts_and_stops_producer() {
        let store = FakeStore {
            fail_part: Some(2),
            ..FakeStore::default()
        };
        let sink = ChunkedSink::new(&store, descriptor(), CHUNK);

        let err = Pipeline::new(producer(10_000)).run(sink).unwrap_err();

        assert!(matches!(err.primary(), Error::Upload(_)));
        let log = store.log.lock().unwrap();
        assert_eq!(log.parts, vec![(1, 1000)]);
        assert!(log.aborted);
        assert!(!log.completed);
    }

    #[test]
    fn test_stage_failure_holds_back_last_part() {
        let store = FakeStore::default();
        let sink = ChunkedSink::new(&store, descriptor(), CHUNK);
        let failing = TaskStage::new("producer", |_, mut out| {
            out.write_all(&[9u8; 2500])?;
            Err(Error::Encryption("cipher failed".into()))
        });

        let err = Pipeline::new(failing).run(sink).unwrap_err();

        assert!(matches!(err.primary(), Error::Encryption(_)));
        let log = store.log.lock().unwrap();
        assert_eq!(log.parts, vec![(1, 1000), (2, 1000)]);
        assert!(log.aborted);
        assert!(!log.completed);
    }

    #[test]
    fn test_nothing_created_before_first_full_chunk() {
        let store = FakeStore::default();
        let sink = ChunkedSink::new(&store, descriptor(), CHUNK);
        let failing = TaskStage::new("producer", |_, mut out| {
            out.write_all(&[9u8; 10])?;
            Err(Error::ArchiveRead("disk error".into()))
        });

        Pipeline::new(failing).run(sink).unwrap_err();

        let log = store.log.lock().unwrap();
        assert_eq!(log.created, 0);
        assert!(!log.aborted);
    }
}
