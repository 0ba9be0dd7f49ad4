//! Container orchestration
//!
//! [`NcaProcessor`] runs one container through the whole pipeline:
//!
//! ```text
//! Init -> HeaderDecoded -> SignatureChecked -> KeysDerived -> PartitionsVerified -> Done
//! ```
//!
//! Header and signature failures end the run. Partition failures are stored
//! in the [`VerificationReport`] and, under [`FailurePolicy::Continue`], never
//! stop the other partitions from being attempted.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use nxguard_crypto::KeySet;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::nca::config::{FailurePolicy, ProcessConfig, SignaturePolicy};
use crate::nca::decrypt::DecryptingSource;
use crate::nca::error::{NcaError, NcaResult};
use crate::nca::hash_tree::HashTreeMetadata;
use crate::nca::header::{MAX_PARTITIONS, NCA_HEADER_SIZE, NcaHeader, PartitionEntry};
use crate::nca::key_area::{ContentKey, KeyDeriver};
use crate::nca::reader::PartitionReader;
use crate::nca::report::{PartitionOutcome, PartitionRecord, VerificationReport};
use crate::nca::signature::{SignatureKeyTable, verify_header};
use crate::nca::source::ByteSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Init,
    HeaderDecoded,
    SignatureChecked,
    KeysDerived,
    PartitionsVerified,
    Done,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::HeaderDecoded => "header decoded",
            Self::SignatureChecked => "signature checked",
            Self::KeysDerived => "keys derived",
            Self::PartitionsVerified => "partitions verified",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

fn enter(state: ProcessState) {
    debug!("NCA processing state: {}", state);
}

/// Runs containers through decode, signature check, key derivation and
/// partition verification
#[derive(Debug, Clone)]
pub struct NcaProcessor<'a> {
    keys: &'a KeySet,
    signature_keys: &'a SignatureKeyTable,
    config: ProcessConfig,
}

impl<'a> NcaProcessor<'a> {
    /// Processor with the default configuration
    pub fn new(keys: &'a KeySet, signature_keys: &'a SignatureKeyTable) -> Self {
        Self {
            keys,
            signature_keys,
            config: ProcessConfig::default(),
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn with_config(mut self, config: ProcessConfig) -> Self {
        self.config = config;
        self
    }

    /// Current configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Process a container the caller may keep sharing
    ///
    /// The returned readers hold their own handle to `source`; it is released
    /// once the caller's clones and the [`ProcessedNca`] are dropped.
    pub fn process(&self, source: Arc<dyn ByteSource>) -> NcaResult<ProcessedNca> {
        enter(ProcessState::Init);
        let header = self.decode_header(source.as_ref())?;
        enter(ProcessState::HeaderDecoded);

        let signature = verify_header(&header, self.signature_keys);
        if self.config.signature_policy == SignaturePolicy::Enforce && !signature.is_authentic() {
            warn!("Rejecting container: header signature {}", signature.fixed_key);
            return Err(NcaError::SignatureInvalid(format!(
                "fixed key {}, ACID {}",
                signature.fixed_key, signature.acid
            )));
        }
        enter(ProcessState::SignatureChecked);

        let mut deriver = KeyDeriver::new(&header, self.keys);
        let mut partition_keys = deriver.derive_all(&header);
        enter(ProcessState::KeysDerived);

        let jobs: Vec<(&PartitionEntry, NcaResult<Option<ContentKey>>)> = header
            .partitions()
            .map(|entry| {
                let key = partition_keys.take(entry.index).unwrap_or_else(|| {
                    Err(NcaError::MissingKey(format!(
                        "no key derived for partition {}",
                        entry.index
                    )))
                });
                (entry, key)
            })
            .collect();

        let run = PartitionRun {
            source: &source,
            verify: self.config.verify,
            abort: self.config.failure_policy == FailurePolicy::Abort,
            cancel: AtomicBool::new(false),
            report: Mutex::new(VerificationReport::new(signature)),
            first_failure: Mutex::new(None),
        };

        let readers = if self.config.parallel {
            run.parallel(jobs)
        } else {
            run.sequential(jobs)
        };

        if let Some((index, err)) = run.first_failure.into_inner() {
            warn!("Aborting after partition {} failed: {}", index, err);
            return Err(NcaError::PartitionFailed {
                index,
                source: Box::new(err),
            });
        }

        let report = run.report.into_inner();
        enter(ProcessState::PartitionsVerified);
        info!(
            "Processed NCA {:016X}: {} partitions, {} failed, signature {}",
            header.program_id,
            report.len(),
            report.failures().count(),
            report.signature.fixed_key
        );
        enter(ProcessState::Done);

        Ok(ProcessedNca {
            header,
            report,
            readers,
        })
    }

    /// Process a container this processor takes ownership of
    pub fn process_owned<S: ByteSource + 'static>(&self, source: S) -> NcaResult<ProcessedNca> {
        self.process(Arc::new(source))
    }

    fn decode_header(&self, source: &dyn ByteSource) -> NcaResult<NcaHeader> {
        if source.size() < NCA_HEADER_SIZE as u64 {
            return Err(NcaError::MalformedHeader(format!(
                "container is {:#x} bytes, smaller than the {NCA_HEADER_SIZE:#x}-byte header",
                source.size()
            )));
        }

        let mut raw = vec![0u8; NCA_HEADER_SIZE];
        source.read_at(0, &mut raw)?;
        let header = NcaHeader::parse(&raw, self.keys.header_key())?;

        if header.content_size != source.size() {
            warn!(
                "Header content size {:#x} differs from source size {:#x}",
                header.content_size,
                source.size()
            );
        }
        Ok(header)
    }
}

/// Shared state of one container's partition pass
struct PartitionRun<'s> {
    source: &'s Arc<dyn ByteSource>,
    verify: bool,
    abort: bool,
    cancel: AtomicBool,
    report: Mutex<VerificationReport>,
    first_failure: Mutex<Option<(usize, NcaError)>>,
}

type Readers = [Option<PartitionReader>; MAX_PARTITIONS];

impl PartitionRun<'_> {
    fn sequential(&self, jobs: Vec<(&PartitionEntry, NcaResult<Option<ContentKey>>)>) -> Readers {
        let mut readers = Readers::default();
        for (entry, key) in jobs {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            readers[entry.index] = self.attempt(entry, key);
        }
        readers
    }

    fn parallel(&self, jobs: Vec<(&PartitionEntry, NcaResult<Option<ContentKey>>)>) -> Readers {
        let mut readers = Readers::default();
        thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(entry, key)| (entry, scope.spawn(move || self.attempt(entry, key))))
                .collect();

            for (entry, handle) in handles {
                match handle.join() {
                    Ok(reader) => readers[entry.index] = reader,
                    Err(_) => {
                        let err = NcaError::Io(io::Error::other("partition worker panicked"));
                        self.fail(entry, err);
                    }
                }
            }
        });
        readers
    }

    /// Run one partition and record its outcome
    fn attempt(
        &self,
        entry: &PartitionEntry,
        key: NcaResult<Option<ContentKey>>,
    ) -> Option<PartitionReader> {
        match self.open(entry, key) {
            Ok((reader, outcome)) => {
                debug!("Partition {}: {:?}", entry.index, outcome);
                self.report.lock().record(PartitionRecord::new(entry, outcome));
                Some(reader)
            }
            Err(err) => {
                self.fail(entry, err);
                None
            }
        }
    }

    fn fail(&self, entry: &PartitionEntry, err: NcaError) {
        warn!("Partition {} failed: {}", entry.index, err);
        self.report
            .lock()
            .record(PartitionRecord::new(entry, PartitionOutcome::failed(&err)));

        if self.abort && !matches!(err, NcaError::Cancelled) {
            self.cancel.store(true, Ordering::Relaxed);
            let mut first = self.first_failure.lock();
            if first.is_none() {
                *first = Some((entry.index, err));
            }
        }
    }

    fn open(
        &self,
        entry: &PartitionEntry,
        key: NcaResult<Option<ContentKey>>,
    ) -> NcaResult<(PartitionReader, PartitionOutcome)> {
        entry.verify_fs_header_hash()?;
        if entry.end() > self.source.size() {
            return Err(NcaError::OutOfRange {
                offset: entry.end(),
                size: self.source.size(),
            });
        }

        let key = key?;
        let kind = entry.fs_header.hash_tree_kind()?;
        let metadata = HashTreeMetadata::parse(kind, &entry.fs_header.hash_info)?;

        let decrypted = Arc::new(DecryptingSource::new(
            Arc::clone(self.source),
            entry,
            key.as_ref(),
        ));
        let reader = PartitionReader::open(entry.index, &metadata, decrypted)?;

        if !self.verify {
            return Ok((reader, PartitionOutcome::Deferred));
        }
        reader.verify_all(&self.cancel)?;
        Ok((reader, PartitionOutcome::Verified))
    }
}

/// A processed container: header, report and verified partition readers
///
/// Readers exist only for partitions whose outcome is verified or deferred.
#[derive(Debug)]
pub struct ProcessedNca {
    header: NcaHeader,
    report: VerificationReport,
    readers: Readers,
}

impl ProcessedNca {
    /// Decoded header
    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    /// Verification results
    pub fn report(&self) -> &VerificationReport {
        &self.report
    }

    /// Reader for partition slot `index`
    pub fn partition(&self, index: usize) -> Option<&PartitionReader> {
        self.readers.get(index).and_then(Option::as_ref)
    }

    /// All available readers in slot order
    pub fn readers(&self) -> impl Iterator<Item = &PartitionReader> {
        self.readers.iter().flatten()
    }

    /// Split into header, report and readers
    pub fn into_parts(self) -> (NcaHeader, VerificationReport, Vec<PartitionReader>) {
        let readers = self.readers.into_iter().flatten().collect();
        (self.header, self.report, readers)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_short_source_is_malformed() {
        let keys = KeySet::new();
        let table = SignatureKeyTable::new();
        let processor = NcaProcessor::new(&keys, &table);

        let result = processor.process_owned(vec![0u8; 0x100]);
        assert!(matches!(result, Err(NcaError::MalformedHeader(_))));
    }

    #[test]
    fn test_encrypted_header_without_key() {
        let keys = KeySet::new();
        let table = SignatureKeyTable::new();
        let processor = NcaProcessor::new(&keys, &table);

        let result = processor.process_owned(vec![0x5Au8; NCA_HEADER_SIZE]);
        assert!(matches!(result, Err(NcaError::MissingKey(_))));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ProcessState::KeysDerived.to_string(), "keys derived");
        assert_eq!(ProcessState::Done.to_string(), "done");
    }
}
