//! Metadata transports
//!
//! A transport knows how to reach one platform's metadata and hands back the
//! raw payload untouched. Every failure is a [`TransportError`], which the
//! orchestrator treats as "try the next candidate".

pub mod serial;
pub mod tree;
pub mod volume;

use bm_error::TransportError;

use crate::context::DetectionContext;
use crate::record::RawMetadataBlob;

pub use serial::SerialTransport;
pub use tree::{DirTreeReader, Ec2Transport, HttpTreeReader, TreeClient, TreeReader};
pub use volume::VolumeReader;

pub trait Transport {
    fn fetch(&self, ctx: &DetectionContext<'_>) -> Result<RawMetadataBlob, TransportError>;
}
