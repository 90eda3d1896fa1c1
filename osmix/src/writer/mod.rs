//! Encode a finalized [`Osm`] back into spec-compliant PBF blocks.
//!
//! The export pipeline is: sorted entity chunks → primitive blocks with a
//! block-local string table → compressed blob frames → the sink.

use crate::blob::{MAX_BLOB_HEADER_SIZE, MAX_BLOB_MESSAGE_SIZE};
use crate::osm::Osm;
use crate::progress::{Progress, Severity};
use crate::proto::{self, blob::Data, Blob, BlobHeader};
use error_stack::{Report, ResultExt};
use flate2::{write::ZlibEncoder, Compression};
use prost::Message;
use rustc_hash::FxHashMap;
use std::io::Write;
use thiserror::Error;

/// Block size cap recommended by the PBF spec.
pub const MAX_ENTITIES_PER_BLOCK: usize = 8000;

#[derive(Debug, Clone, Error)]
pub enum OsmWriterError {
    #[error("Export requires a finalized index")]
    NotReady,
    #[error("Failed to write PBF stream")]
    Write,
    #[error("Blob header of {0} bytes exceeds the {MAX_BLOB_HEADER_SIZE} byte limit")]
    HeaderTooBig(u64),
    #[error("Blob of {0} bytes exceeds the {MAX_BLOB_MESSAGE_SIZE} byte limit")]
    MessageTooBig(u64),
    #[error("Export aborted")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Zlib level for data blobs; `None` writes raw blobs.
    pub compression: Option<u32>,
    pub entities_per_block: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            compression: Some(Compression::default().level()),
            entities_per_block: MAX_ENTITIES_PER_BLOCK,
        }
    }
}

/// Writes one OSMHeader blob followed by OSMData blobs of dense nodes,
/// ways and relations, each ascending by id.
pub fn write_pbf<W: Write>(
    osm: &Osm,
    out: W,
    options: &WriterOptions,
    progress: &Progress,
) -> Result<(), Report<OsmWriterError>> {
    osm.ensure_ready()
        .change_context(OsmWriterError::NotReady)?;

    let mut writer = BlobWriter {
        out,
        compression: options.compression,
    };
    writer.write_blob("OSMHeader", encode_header(osm).encode_to_vec())?;

    let per_block = options.entities_per_block.clamp(1, MAX_ENTITIES_PER_BLOCK);
    let mut blocks = 0usize;

    let nodes: Vec<u32> = osm.nodes.sorted().collect();
    for chunk in nodes.chunks(per_block) {
        write_split_blocks(&mut writer, osm, chunk, &dense_node_block)?;
        blocks += 1;
        check_abort(progress, blocks)?;
    }
    let ways: Vec<u32> = osm.ways.sorted().collect();
    for chunk in ways.chunks(per_block) {
        write_split_blocks(&mut writer, osm, chunk, &way_block)?;
        blocks += 1;
        check_abort(progress, blocks)?;
    }
    let relations: Vec<u32> = osm.relations.sorted().collect();
    for chunk in relations.chunks(per_block) {
        write_split_blocks(&mut writer, osm, chunk, &relation_block)?;
        blocks += 1;
        check_abort(progress, blocks)?;
    }

    progress.emit(Severity::Ready, format!("wrote {blocks} data blocks"));
    Ok(())
}

fn check_abort(progress: &Progress, blocks: usize) -> Result<(), Report<OsmWriterError>> {
    if progress.is_cancelled() {
        return Err(Report::new(OsmWriterError::Aborted));
    }
    if blocks % 64 == 0 {
        progress.emit(Severity::Debug, format!("wrote {blocks} blocks"));
    }
    Ok(())
}

fn encode_header(osm: &Osm) -> proto::HeaderBlock {
    let header = &osm.header;
    let mut required = header.required_features.clone();
    for feature in ["OsmSchema-V0.6", "DenseNodes"] {
        if !required.iter().any(|f| f == feature) {
            required.push(feature.to_owned());
        }
    }
    proto::HeaderBlock {
        bbox: header.bbox.map(|[min_lon, min_lat, max_lon, max_lat]| {
            proto::HeaderBBox {
                left: (min_lon * 1e9) as i64,
                right: (max_lon * 1e9) as i64,
                top: (max_lat * 1e9) as i64,
                bottom: (min_lat * 1e9) as i64,
            }
        }),
        required_features: required,
        optional_features: header.optional_features.clone(),
        writingprogram: Some(
            header
                .writing_program
                .clone()
                .unwrap_or_else(|| "osmix".to_owned()),
        ),
        source: header.source.clone(),
        osmosis_replication_timestamp: header.replication_timestamp,
        osmosis_replication_sequence_number: header.replication_sequence_number,
        osmosis_replication_base_url: None,
    }
}

/// Encodes a chunk and writes it, splitting in half whenever the encoded
/// block would overflow the blob size limit. The split never surfaces to
/// callers.
fn write_split_blocks<W: Write>(
    writer: &mut BlobWriter<W>,
    osm: &Osm,
    chunk: &[u32],
    build: &dyn Fn(&Osm, &[u32]) -> proto::PrimitiveBlock,
) -> Result<(), Report<OsmWriterError>> {
    let payload = build(osm, chunk).encode_to_vec();
    if payload.len() as u64 >= MAX_BLOB_MESSAGE_SIZE && chunk.len() > 1 {
        let mid = chunk.len() / 2;
        write_split_blocks(writer, osm, &chunk[..mid], build)?;
        return write_split_blocks(writer, osm, &chunk[mid..], build);
    }
    writer.write_blob("OSMData", payload)
}

/// Block-local string table. Index 0 is reserved blank.
struct StringTableBuilder {
    strings: Vec<Vec<u8>>,
    id_map: FxHashMap<String, u32>,
}

impl StringTableBuilder {
    fn new() -> Self {
        StringTableBuilder {
            strings: vec![Vec::new()],
            id_map: FxHashMap::default(),
        }
    }

    fn add(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.id_map.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.as_bytes().to_vec());
        self.id_map.insert(s.to_owned(), id);
        id
    }

    fn finish(self) -> proto::StringTable {
        proto::StringTable { s: self.strings }
    }
}

fn empty_block() -> proto::PrimitiveBlock {
    proto::PrimitiveBlock {
        stringtable: proto::StringTable::default(),
        primitivegroup: Vec::new(),
        granularity: None,
        lat_offset: None,
        lon_offset: None,
        date_granularity: None,
    }
}

/// Dense node group: ids and coordinates delta-coded against the previous
/// node, tags in the packed keyval stream. Granularity stays at the
/// default 100 nanodegrees, so the stored values are the quantised
/// decimicrodegrees unchanged.
fn dense_node_block(osm: &Osm, chunk: &[u32]) -> proto::PrimitiveBlock {
    let mut table = StringTableBuilder::new();
    let mut dense = proto::DenseNodes {
        id: Vec::with_capacity(chunk.len()),
        denseinfo: None,
        lat: Vec::with_capacity(chunk.len()),
        lon: Vec::with_capacity(chunk.len()),
        keys_vals: Vec::new(),
    };

    let mut prev_id = 0i64;
    let mut prev_lat = 0i64;
    let mut prev_lon = 0i64;
    let mut any_tags = false;
    for &i in chunk {
        let i = i as usize;
        let id = osm.nodes.id(i);
        let lat = osm.nodes.lat_q(i) as i64;
        let lon = osm.nodes.lon_q(i) as i64;
        dense.id.push(id - prev_id);
        dense.lat.push(lat - prev_lat);
        dense.lon.push(lon - prev_lon);
        prev_id = id;
        prev_lat = lat;
        prev_lon = lon;

        for (k, v) in osm.nodes.get_tags(i, &osm.strings) {
            dense.keys_vals.push(table.add(&k) as i32);
            dense.keys_vals.push(table.add(&v) as i32);
            any_tags = true;
        }
        dense.keys_vals.push(0);
    }
    if !any_tags {
        dense.keys_vals.clear();
    }

    let mut block = empty_block();
    block.stringtable = table.finish();
    block.primitivegroup.push(proto::PrimitiveGroup {
        nodes: Vec::new(),
        dense: Some(dense),
        ways: Vec::new(),
        relations: Vec::new(),
        changesets: Vec::new(),
    });
    block
}

fn way_block(osm: &Osm, chunk: &[u32]) -> proto::PrimitiveBlock {
    let mut table = StringTableBuilder::new();
    let mut ways = Vec::with_capacity(chunk.len());
    for &i in chunk {
        let i = i as usize;
        let mut keys = Vec::new();
        let mut vals = Vec::new();
        for (k, v) in osm.ways.get_tags(i, &osm.strings) {
            keys.push(table.add(&k));
            vals.push(table.add(&v));
        }
        let mut prev = 0i64;
        let refs = osm
            .ways
            .refs(i)
            .iter()
            .map(|&r| {
                let delta = r - prev;
                prev = r;
                delta
            })
            .collect();
        ways.push(proto::Way {
            id: osm.ways.id(i),
            keys,
            vals,
            info: None,
            refs,
        });
    }

    let mut block = empty_block();
    block.stringtable = table.finish();
    block.primitivegroup.push(proto::PrimitiveGroup {
        nodes: Vec::new(),
        dense: None,
        ways,
        relations: Vec::new(),
        changesets: Vec::new(),
    });
    block
}

fn relation_block(osm: &Osm, chunk: &[u32]) -> proto::PrimitiveBlock {
    let mut table = StringTableBuilder::new();
    let mut relations = Vec::with_capacity(chunk.len());
    for &i in chunk {
        let i = i as usize;
        let mut keys = Vec::new();
        let mut vals = Vec::new();
        for (k, v) in osm.relations.get_tags(i, &osm.strings) {
            keys.push(table.add(&k));
            vals.push(table.add(&v));
        }
        let mut roles_sid = Vec::new();
        let mut memids = Vec::new();
        let mut types = Vec::new();
        let mut prev = 0i64;
        for (mtype, mref, role_idx) in osm.relations.raw_members(i) {
            roles_sid.push(table.add(osm.strings.get(role_idx)) as i32);
            memids.push(mref - prev);
            prev = mref;
            types.push(mtype as i32);
        }
        relations.push(proto::Relation {
            id: osm.relations.id(i),
            keys,
            vals,
            info: None,
            roles_sid,
            memids,
            types,
        });
    }

    let mut block = empty_block();
    block.stringtable = table.finish();
    block.primitivegroup.push(proto::PrimitiveGroup {
        nodes: Vec::new(),
        dense: None,
        ways: Vec::new(),
        relations,
        changesets: Vec::new(),
    });
    block
}

/// Frames encoded blocks as length-prefixed BlobHeader/Blob pairs.
struct BlobWriter<W: Write> {
    out: W,
    compression: Option<u32>,
}

impl<W: Write> BlobWriter<W> {
    fn write_blob(
        &mut self,
        blob_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), Report<OsmWriterError>> {
        let raw_size = payload.len() as i32;
        let blob = match self.compression {
            Some(level) => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
                encoder
                    .write_all(&payload)
                    .change_context(OsmWriterError::Write)?;
                let compressed = encoder.finish().change_context(OsmWriterError::Write)?;
                Blob {
                    raw_size: Some(raw_size),
                    data: Some(Data::ZlibData(compressed)),
                }
            }
            None => Blob {
                raw_size: Some(raw_size),
                data: Some(Data::Raw(payload)),
            },
        };

        let blob_bytes = blob.encode_to_vec();
        if blob_bytes.len() as u64 >= MAX_BLOB_MESSAGE_SIZE {
            return Err(Report::new(OsmWriterError::MessageTooBig(
                blob_bytes.len() as u64,
            )));
        }

        let header = BlobHeader {
            r#type: blob_type.to_owned(),
            indexdata: None,
            datasize: blob_bytes.len() as i32,
        };
        let header_bytes = header.encode_to_vec();
        if header_bytes.len() as u64 >= MAX_BLOB_HEADER_SIZE {
            return Err(Report::new(OsmWriterError::HeaderTooBig(
                header_bytes.len() as u64,
            )));
        }

        self.out
            .write_all(&(header_bytes.len() as u32).to_be_bytes())
            .change_context(OsmWriterError::Write)?;
        self.out
            .write_all(&header_bytes)
            .change_context(OsmWriterError::Write)?;
        self.out
            .write_all(&blob_bytes)
            .change_context(OsmWriterError::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Node;

    #[test]
    fn test_write_requires_ready() {
        let osm = Osm::new();
        let mut out = Vec::new();
        let result = write_pbf(&osm, &mut out, &WriterOptions::default(), &Progress::new());
        assert!(matches!(
            result.unwrap_err().current_context(),
            OsmWriterError::NotReady
        ));
    }

    #[test]
    fn test_dense_block_is_delta_coded() {
        let mut osm = Osm::new();
        for (id, lon, lat) in [(10, 1.0, 1.0), (12, 1.0000001, 1.0), (11, 2.0, 3.0)] {
            osm.add_node(&Node {
                id,
                lon,
                lat,
                tags: Vec::new(),
            });
        }
        osm.build_indexes().unwrap();

        let chunk: Vec<u32> = osm.nodes.sorted().collect();
        let block = dense_node_block(&osm, &chunk);
        let dense = block.primitivegroup[0].dense.as_ref().unwrap();
        assert_eq!(dense.id, vec![10, 1, 1]);
        assert_eq!(dense.lon, vec![10_000_000, 10_000_000, -9_999_999]);
        // tagless chunk omits the keyval stream entirely
        assert!(dense.keys_vals.is_empty());
    }
}
