//! Streaming PBF decode into an [`Osm`] index.

use crate::blob::{MAX_BLOB_HEADER_SIZE, MAX_BLOB_MESSAGE_SIZE};
use crate::model::EntityType;
use crate::osm::{Osm, OsmHeader};
use crate::progress::{Progress, Severity};
use crate::proto::{self, Blob, BlobHeader};
use crate::store::StoreError;
use error_stack::{Report, ResultExt};
use geo::Rect;
use itertools::izip;
use prost::Message;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::sync::mpsc;

/// Packed delta value decoder
pub struct Delta<I> {
    acu: Option<i64>,
    iter: I,
}

impl<I> Delta<I> {
    pub fn new(iter: I) -> Self {
        Delta { acu: None, iter }
    }
}

impl<I: Iterator<Item = i64>> Iterator for Delta<I> {
    type Item = i64;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|v| match &mut self.acu {
            Some(acu) => {
                *acu += v;

                *acu
            }
            None => {
                self.acu = Some(v);

                v
            }
        })
    }
}

pub trait IntoDelta: Sized {
    fn delta(self) -> Delta<Self>;
}

impl<I: Iterator<Item = i64>> IntoDelta for I {
    fn delta(self) -> Delta<Self> {
        Delta::new(self)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OsmReaderError {
    #[error("Failed to read PBF stream")]
    Read,
    #[error("Failed to decode PBF data")]
    Decode,
    #[error("Blob header of {0} bytes exceeds the {MAX_BLOB_HEADER_SIZE} byte limit")]
    HeaderTooBig(u64),
    #[error("Blob of {0} bytes exceeds the {MAX_BLOB_MESSAGE_SIZE} byte limit")]
    MessageTooBig(u64),
    #[error("First blob is not an OSMHeader")]
    MissingOsmHeader,
    #[error("Unknown required feature {0:?}")]
    UnsupportedFeature(String),
    #[error("Plain (non-dense) node groups are not supported")]
    NonDenseNodes,
    #[error("A way or relation references an entity missing from the input")]
    MissingReference,
    #[error("Failed to finalize the index")]
    Finalize,
    #[error("Ingest aborted")]
    Aborted,
}

/// Decode options. Concurrency and filtering are opt-in; the default is a
/// sequential, permissive, whole-file decode.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Filter to this bbox while decoding: nodes inline, then ways by
    /// ref-presence, then relations by member-presence.
    pub extract_bbox: Option<Rect>,
    /// Decode blobs on this many worker threads (> 1). Results are merged
    /// into the store in blob order regardless.
    pub parse_concurrency: usize,
    /// Fail on dangling way refs / relation members instead of logging.
    pub strict_refs: bool,
}

struct BboxFilter {
    bbox: Rect,
    kept_nodes: FxHashSet<i64>,
    kept_ways: FxHashSet<i64>,
    kept_relations: FxHashSet<i64>,
}

/// Reads a whole `*.osm.pbf` stream into a finalized [`Osm`]. On any
/// fatal error (or abort) the partial index is discarded; the caller never
/// observes a half-ingested store.
pub fn read_pbf<R: Read>(
    input: R,
    options: &ReaderOptions,
    progress: &Progress,
) -> Result<Osm, Report<OsmReaderError>> {
    let mut reader = OsmBlobReader::new(input);
    let mut osm = Osm::new();
    let mut filter = options.extract_bbox.map(|bbox| BboxFilter {
        bbox,
        kept_nodes: FxHashSet::default(),
        kept_ways: FxHashSet::default(),
        kept_relations: FxHashSet::default(),
    });

    let (header, header_data) = reader
        .next_frame()?
        .ok_or_else(|| Report::new(OsmReaderError::MissingOsmHeader))?;
    if header.r#type != "OSMHeader" {
        return Err(Report::new(OsmReaderError::MissingOsmHeader));
    }
    osm.header = decode_header(&header_data)?;

    if options.parse_concurrency > 1 {
        read_blocks_parallel(&mut reader, &mut osm, &mut filter, options, progress)?;
    } else {
        read_blocks_sequential(&mut reader, &mut osm, &mut filter, progress)?;
    }

    osm.build_indexes()
        .change_context(OsmReaderError::Finalize)?;
    if filter.is_none() {
        check_references(&osm, options.strict_refs)?;
    }
    progress.emit(Severity::Ready, format!("Ingested {:?}", osm.info()));
    Ok(osm)
}

fn read_blocks_sequential<R: Read>(
    reader: &mut OsmBlobReader<R>,
    osm: &mut Osm,
    filter: &mut Option<BboxFilter>,
    progress: &Progress,
) -> Result<(), Report<OsmReaderError>> {
    let mut blob_index = 0usize;
    while let Some((header, data)) = reader.next_frame()? {
        if progress.is_cancelled() {
            return Err(Report::new(OsmReaderError::Aborted));
        }
        if header.r#type != "OSMData" {
            log::warn!("skipping blob of unknown type {:?}", header.r#type);
            continue;
        }
        let block = decode_block(&data)?;
        ingest_block(osm, &block, filter)?;
        blob_index += 1;
        if blob_index % 64 == 0 {
            progress.emit(Severity::Debug, format!("decoded {blob_index} blobs"));
        }
    }
    Ok(())
}

fn read_blocks_parallel<R: Read>(
    reader: &mut OsmBlobReader<R>,
    osm: &mut Osm,
    filter: &mut Option<BboxFilter>,
    options: &ReaderOptions,
    progress: &Progress,
) -> Result<(), Report<OsmReaderError>> {
    let pool = threadpool::ThreadPool::new(options.parse_concurrency);
    let (tx, rx) = mpsc::channel::<(usize, Result<proto::PrimitiveBlock, Report<OsmReaderError>>)>();

    let mut dispatched = 0usize;
    while let Some((header, data)) = reader.next_frame()? {
        if progress.is_cancelled() {
            return Err(Report::new(OsmReaderError::Aborted));
        }
        if header.r#type != "OSMData" {
            log::warn!("skipping blob of unknown type {:?}", header.r#type);
            continue;
        }
        let tx = tx.clone();
        let index = dispatched;
        pool.execute(move || {
            // the receiver may be gone after a fatal error; nothing to do
            let _ = tx.send((index, decode_block(&data)));
        });
        dispatched += 1;
    }
    drop(tx);

    // workers finish out of order; buffer and drain strictly in blob order
    let mut pending: BTreeMap<usize, proto::PrimitiveBlock> = BTreeMap::new();
    let mut next = 0usize;
    for (index, decoded) in rx {
        if progress.is_cancelled() {
            return Err(Report::new(OsmReaderError::Aborted));
        }
        pending.insert(index, decoded?);
        while let Some(block) = pending.remove(&next) {
            ingest_block(osm, &block, filter)?;
            next += 1;
        }
    }
    debug_assert!(pending.is_empty());
    Ok(())
}

fn decode_block(data: &[u8]) -> Result<proto::PrimitiveBlock, Report<OsmReaderError>> {
    let blob = Blob::decode(data).change_context(OsmReaderError::Decode)?;
    let buffer = blob.extract().change_context(OsmReaderError::Decode)?;
    proto::PrimitiveBlock::decode(buffer).change_context(OsmReaderError::Decode)
}

const KNOWN_FEATURES: &[&str] = &["OsmSchema-V0.6", "DenseNodes", "HistoricalInformation"];

fn decode_header(data: &[u8]) -> Result<OsmHeader, Report<OsmReaderError>> {
    let blob = Blob::decode(data).change_context(OsmReaderError::Decode)?;
    let buffer = blob.extract().change_context(OsmReaderError::Decode)?;
    let block = proto::HeaderBlock::decode(buffer).change_context(OsmReaderError::Decode)?;

    for feature in &block.required_features {
        if !KNOWN_FEATURES.contains(&feature.as_str()) {
            return Err(Report::new(OsmReaderError::UnsupportedFeature(
                feature.clone(),
            )));
        }
    }

    Ok(OsmHeader {
        writing_program: block.writingprogram,
        source: block.source,
        bbox: block.bbox.map(|bbox| {
            [
                1e-9 * bbox.left as f64,
                1e-9 * bbox.bottom as f64,
                1e-9 * bbox.right as f64,
                1e-9 * bbox.top as f64,
            ]
        }),
        replication_timestamp: block.osmosis_replication_timestamp,
        replication_sequence_number: block.osmosis_replication_sequence_number,
        required_features: block.required_features,
        optional_features: block.optional_features,
    })
}

fn ingest_block(
    osm: &mut Osm,
    block: &proto::PrimitiveBlock,
    filter: &mut Option<BboxFilter>,
) -> Result<(), Report<OsmReaderError>> {
    let remap = osm.strings.create_block_index_map(&block.stringtable.s);

    for group in &block.primitivegroup {
        if !group.nodes.is_empty() {
            return Err(Report::new(OsmReaderError::NonDenseNodes));
        }

        if let Some(dense) = &group.dense {
            match filter.as_mut() {
                Some(f) => {
                    osm.nodes
                        .add_dense(block, dense, &remap, Some((f.bbox, &mut f.kept_nodes)));
                }
                None => {
                    osm.nodes.add_dense(block, dense, &remap, None);
                }
            }
        }

        for way in &group.ways {
            let pairs = izip!(way.keys.iter(), way.vals.iter())
                .map(|(&k, &v)| (remap[k as usize], remap[v as usize]));
            match filter.as_mut() {
                Some(f) => {
                    let kept: Vec<i64> = way
                        .refs
                        .iter()
                        .copied()
                        .delta()
                        .filter(|r| f.kept_nodes.contains(r))
                        .collect();
                    if kept.is_empty() {
                        continue;
                    }
                    f.kept_ways.insert(way.id);
                    osm.ways.push_raw(way.id, kept.into_iter(), pairs);
                }
                None => {
                    osm.ways
                        .push_raw(way.id, way.refs.iter().copied().delta(), pairs);
                }
            }
        }

        for relation in &group.relations {
            let pairs = izip!(relation.keys.iter(), relation.vals.iter())
                .map(|(&k, &v)| (remap[k as usize], remap[v as usize]));
            let members = izip!(
                relation.types.iter(),
                relation.roles_sid.iter(),
                relation.memids.iter().copied().delta(),
            )
            .map(|(&mtype, &role, mref)| (mtype as u8, mref, remap[role as usize]));

            match filter.as_mut() {
                Some(f) => {
                    let kept: Vec<(u8, i64, u32)> = members
                        .filter(|&(mtype, mref, _)| match mtype {
                            0 => f.kept_nodes.contains(&mref),
                            1 => f.kept_ways.contains(&mref),
                            _ => f.kept_relations.contains(&mref),
                        })
                        .collect();
                    if kept.is_empty() {
                        continue;
                    }
                    f.kept_relations.insert(relation.id);
                    osm.relations
                        .push_raw(relation.id, kept.into_iter(), pairs);
                }
                None => {
                    osm.relations.push_raw(relation.id, members, pairs);
                }
            }
        }
    }
    Ok(())
}

/// Reference completeness check for whole-file ingests. Permissive mode
/// logs a summary; strict mode fails on the first dangling reference.
fn check_references(osm: &Osm, strict: bool) -> Result<(), Report<OsmReaderError>> {
    let mut dangling = 0usize;
    for i in 0..osm.ways.len() {
        for &r in osm.ways.refs(i) {
            if !osm.nodes.contains(r) {
                if strict {
                    return Err(Report::new(StoreError::MissingReference {
                        kind: EntityType::Way,
                        id: osm.ways.id(i),
                        missing: r,
                    })
                    .change_context(OsmReaderError::MissingReference));
                }
                dangling += 1;
            }
        }
    }
    for i in 0..osm.relations.len() {
        for (mtype, mref, _) in osm.relations.raw_members(i) {
            let present = match mtype {
                0 => osm.nodes.contains(mref),
                1 => osm.ways.contains(mref),
                _ => true, // relation members may reference any load order
            };
            if !present {
                if strict {
                    return Err(Report::new(StoreError::MissingReference {
                        kind: EntityType::Relation,
                        id: osm.relations.id(i),
                        missing: mref,
                    })
                    .change_context(OsmReaderError::MissingReference));
                }
                dangling += 1;
            }
        }
    }
    if dangling > 0 {
        log::warn!("input has {dangling} dangling references");
    }
    Ok(())
}

/// Length-prefixed blob frame reader.
pub struct OsmBlobReader<R> {
    input: R,
    header_len_buffer: [u8; 4],
    header_buffer: Vec<u8>,
    blob_buffer: Vec<u8>,
}

impl<R: Read> OsmBlobReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            header_len_buffer: [0; 4],
            header_buffer: Vec::new(),
            blob_buffer: Vec::new(),
        }
    }

    /// Next (BlobHeader, raw blob bytes) frame, or `None` at a clean EOF.
    fn next_frame(&mut self) -> Result<Option<(BlobHeader, Vec<u8>)>, Report<OsmReaderError>> {
        if let Err(err) = self.input.read_exact(&mut self.header_len_buffer) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(Report::new(err).change_context(OsmReaderError::Read));
        }

        let header_len = u32::from_be_bytes(self.header_len_buffer) as u64;
        if header_len >= MAX_BLOB_HEADER_SIZE {
            return Err(Report::new(OsmReaderError::HeaderTooBig(header_len)));
        }

        self.header_buffer.resize(header_len as usize, 0);
        self.input
            .read_exact(self.header_buffer.as_mut())
            .change_context(OsmReaderError::Read)?;
        let header = BlobHeader::decode(self.header_buffer.as_slice())
            .change_context(OsmReaderError::Decode)?;

        let datasize = header.datasize as u64;
        if header.datasize < 0 || datasize >= MAX_BLOB_MESSAGE_SIZE {
            return Err(Report::new(OsmReaderError::MessageTooBig(datasize)));
        }

        self.blob_buffer.resize(datasize as usize, 0);
        self.input
            .read_exact(self.blob_buffer.as_mut())
            .change_context(OsmReaderError::Read)?;

        Ok(Some((header, self.blob_buffer.clone())))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_delta_decoder() {
        let deltas = [10i64, 1, 1, -5];
        let values: Vec<i64> = deltas.into_iter().delta().collect();
        assert_eq!(values, vec![10, 11, 12, 7]);
    }

    #[test]
    fn test_empty_input_is_missing_header() {
        let result = read_pbf(&b""[..], &ReaderOptions::default(), &Progress::new());
        assert!(matches!(
            result.unwrap_err().current_context(),
            OsmReaderError::MissingOsmHeader
        ));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&(MAX_BLOB_HEADER_SIZE as u32).to_be_bytes());
        data.extend_from_slice(&[0u8; 16]);
        let mut reader = OsmBlobReader::new(&data[..]);
        assert!(matches!(
            reader.next_frame().unwrap_err().current_context(),
            OsmReaderError::HeaderTooBig(_)
        ));
    }
}
