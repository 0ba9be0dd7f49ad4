//! Container formats for console content archives
//!
//! This crate decodes and verifies NCA content archives. Nothing it exposes
//! has skipped verification: partition bytes are only readable through a
//! [`PartitionReader`](nca::PartitionReader), which checks every block
//! against the partition's hash tree before returning it.
//!
//! # Pipeline
//!
//! 1. **Header Codec**: decrypt and decode the 0xC00-byte header block
//! 2. **Signature Validator**: check the header signatures against a
//!    caller-supplied key table
//! 3. **Key Derivation**: unwrap per-partition content keys from the key
//!    area or a title key
//! 4. **Integrity Verification**: open the flat or layered hash tree of each
//!    partition and walk its blocks
//! 5. **Report**: record a verified, deferred or failed outcome per
//!    partition
//!
//! # Example
//!
//! ```no_run
//! use nxguard_crypto::KeySet;
//! use nxguard_formats::nca::{NcaProcessor, ReaderSource, SignatureKeyTable};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut keys = KeySet::new();
//! keys.load_prod_keys_file("prod.keys")?;
//!
//! let source = ReaderSource::new(std::fs::File::open("program.nca")?)?;
//! let processed = NcaProcessor::new(&keys, &SignatureKeyTable::new()).process_owned(source)?;
//!
//! for record in processed.report().partitions() {
//!     println!("partition {}: {:?}", record.index, record.outcome);
//! }
//! if let Some(reader) = processed.partition(0) {
//!     let first = reader.read(0, 0x100)?;
//!     println!("{} verified bytes", first.len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::uninlined_format_args)] // Log messages use positional arguments

pub mod nca;

pub use nca::{NcaError, NcaProcessor, NcaResult, ProcessConfig, VerificationReport};
