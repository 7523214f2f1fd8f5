use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::model::{
    TtsError, DIM_FEAT, DIM_FEAT_INPUT, NUM_EMBEDS_ENERGY, NUM_EMBEDS_PITCH, NUM_FFT_BINS, NUM_MELS,
};
use super::quant::{embed_lookup, find_bin};

/// A row-major `[rows, dim]` int16 embedding table in Q11.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    weights: Vec<i16>,
    rows: usize,
    dim: usize,
}

impl EmbeddingTable {
    pub fn new(weights: Vec<i16>, dim: usize) -> Result<Self, TtsError> {
        if dim == 0 || weights.is_empty() || weights.len() % dim != 0 {
            return Err(TtsError::TableParse(format!(
                "embedding of {} values cannot be split into rows of {dim}",
                weights.len()
            )));
        }
        Ok(Self {
            rows: weights.len() / dim,
            weights,
            dim,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, index: usize) -> Option<&[i16]> {
        (index < self.rows).then(|| embed_lookup(&self.weights, index, self.dim))
    }
}

/// An embedding indexed by binning a continuous prediction.
#[derive(Debug, Clone)]
pub struct BinnedEmbedding {
    embedding: EmbeddingTable,
    bins: Vec<f32>,
}

impl BinnedEmbedding {
    /// `bins` must hold `rows - 1` non-decreasing boundaries.
    pub fn new(embedding: EmbeddingTable, bins: Vec<f32>) -> Result<Self, TtsError> {
        if bins.len() + 1 != embedding.rows() {
            return Err(TtsError::TableParse(format!(
                "{} bin boundaries for {} embedding rows",
                bins.len(),
                embedding.rows()
            )));
        }
        if bins.windows(2).any(|w| !(w[0] <= w[1])) {
            return Err(TtsError::TableParse(
                "bin boundaries must be non-decreasing".to_string(),
            ));
        }
        Ok(Self { embedding, bins })
    }

    pub fn num_embeds(&self) -> usize {
        self.embedding.rows()
    }

    pub fn dim(&self) -> usize {
        self.embedding.dim()
    }

    /// Bin index for `value` and the embedding row it selects.
    pub fn lookup(&self, value: f32) -> (usize, &[i16]) {
        let bin = find_bin(self.num_embeds(), &self.bins, value);
        let row = embed_lookup(&self.embedding.weights, bin, self.embedding.dim);
        (bin, row)
    }
}

/// Pseudo-inverse of the mel filterbank, `[NUM_FFT_BINS, NUM_MELS]` row-major.
#[derive(Debug, Clone)]
pub struct MelInverse {
    weights: Vec<f32>,
}

impl MelInverse {
    pub fn new(weights: Vec<f32>) -> Result<Self, TtsError> {
        if weights.len() != NUM_FFT_BINS * NUM_MELS {
            return Err(TtsError::TableParse(format!(
                "mel inverse has {} values, expected {}x{}",
                weights.len(),
                NUM_FFT_BINS,
                NUM_MELS
            )));
        }
        Ok(Self { weights })
    }

    /// Weights mapping every mel band onto linear bin `bin`.
    pub fn row(&self, bin: usize) -> &[f32] {
        &self.weights[bin * NUM_MELS..(bin + 1) * NUM_MELS]
    }
}

/// Read-only tables used between the two networks.
#[derive(Debug, Clone)]
pub struct FuseTables {
    pub input_embed: EmbeddingTable,
    pub pitch: BinnedEmbedding,
    pub energy: BinnedEmbedding,
    pub mel_inverse: MelInverse,
}

impl FuseTables {
    pub fn new(
        input_embed: EmbeddingTable,
        pitch: BinnedEmbedding,
        energy: BinnedEmbedding,
        mel_inverse: MelInverse,
    ) -> Result<Self, TtsError> {
        if input_embed.dim() != DIM_FEAT_INPUT {
            return Err(TtsError::TableParse(format!(
                "input embedding is {} wide, expected {DIM_FEAT_INPUT}",
                input_embed.dim()
            )));
        }
        for (name, table) in [("pitch", &pitch), ("energy", &energy)] {
            if table.dim() != DIM_FEAT {
                return Err(TtsError::TableParse(format!(
                    "{name} embedding is {} wide, expected {DIM_FEAT}",
                    table.dim()
                )));
            }
        }
        Ok(Self {
            input_embed,
            pitch,
            energy,
            mel_inverse,
        })
    }

    /// Load every table from a `.npz` archive.
    ///
    /// Expected entries: `input_embed`, `pitch_embed`, `energy_embed` (int16),
    /// `pitch_bins`, `energy_bins`, `mel_inverse` (float32).
    pub fn load(path: &Path) -> Result<Self, TtsError> {
        let mut arrays = read_npz(path)?;
        let mut take = |name: &str| {
            arrays
                .remove(name)
                .ok_or_else(|| TtsError::TableParse(format!("{}: missing '{name}'", path.display())))
        };

        let input_embed =
            EmbeddingTable::new(take("input_embed")?.into_i16("input_embed")?, DIM_FEAT_INPUT)?;
        let pitch = BinnedEmbedding::new(
            EmbeddingTable::new(take("pitch_embed")?.into_i16("pitch_embed")?, DIM_FEAT)?,
            take("pitch_bins")?.into_f32("pitch_bins")?,
        )?;
        let energy = BinnedEmbedding::new(
            EmbeddingTable::new(take("energy_embed")?.into_i16("energy_embed")?, DIM_FEAT)?,
            take("energy_bins")?.into_f32("energy_bins")?,
        )?;
        let mel_inverse = MelInverse::new(take("mel_inverse")?.into_f32("mel_inverse")?)?;

        for (name, table, expected) in [
            ("pitch", &pitch, NUM_EMBEDS_PITCH),
            ("energy", &energy, NUM_EMBEDS_ENERGY),
        ] {
            if table.num_embeds() != expected {
                log::warn!(
                    "{name} table has {} bins, the deployed models use {expected}",
                    table.num_embeds()
                );
            }
        }
        log::info!(
            "Loaded tables: {} token embeddings, {} pitch bins, {} energy bins",
            input_embed.rows(),
            pitch.num_embeds(),
            energy.num_embeds()
        );
        Self::new(input_embed, pitch, energy, mel_inverse)
    }
}

/// Element data of a parsed `.npy` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum NpyData {
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl NpyData {
    pub(crate) fn into_i16(self, name: &str) -> Result<Vec<i16>, TtsError> {
        match self {
            NpyData::I16(v) => Ok(v),
            NpyData::F32(_) => Err(TtsError::TableParse(format!("{name}: expected int16 data"))),
        }
    }

    fn into_f32(self, name: &str) -> Result<Vec<f32>, TtsError> {
        match self {
            NpyData::F32(v) => Ok(v),
            NpyData::I16(_) => Err(TtsError::TableParse(format!("{name}: expected float32 data"))),
        }
    }
}

/// Read all `.npy` entries of a `.npz` archive, keyed by entry name without extension.
pub fn read_npz(path: &Path) -> Result<HashMap<String, NpyData>, TtsError> {
    let file = File::open(path)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| TtsError::TableParse(format!("Failed to open zip archive: {e}")))?;

    let mut arrays = HashMap::new();
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| TtsError::TableParse(format!("Failed to read zip entry {i}: {e}")))?;

        let raw_name = entry.name().to_string();
        if raw_name.ends_with('/') {
            continue;
        }
        let name = raw_name.trim_end_matches(".npy").to_string();

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| TtsError::TableParse(format!("Failed to read {raw_name}: {e}")))?;

        arrays.insert(name, parse_npy(&data, &raw_name)?);
    }
    Ok(arrays)
}

/// Parse a little-endian, C-ordered `.npy` payload of `<i2` or `<f4` values.
pub fn parse_npy(data: &[u8], name: &str) -> Result<NpyData, TtsError> {
    if data.len() < 10 {
        return Err(TtsError::TableParse(format!(
            "{name}: file too short ({} bytes)",
            data.len()
        )));
    }

    if &data[0..6] != b"\x93NUMPY" {
        return Err(TtsError::TableParse(format!(
            "{name}: invalid numpy magic bytes"
        )));
    }

    // v1 stores the header length in 2 bytes, v2/v3 in 4
    let (header_start, header_len) = match data[6] {
        1 => (10, u16::from_le_bytes([data[8], data[9]]) as usize),
        2 | 3 if data.len() >= 12 => (
            12,
            u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize,
        ),
        v => {
            return Err(TtsError::TableParse(format!(
                "{name}: unsupported npy version {v}"
            )))
        }
    };
    let data_offset = header_start + header_len;
    if data.len() < data_offset {
        return Err(TtsError::TableParse(format!(
            "{name}: header truncated (need {data_offset} bytes, got {})",
            data.len()
        )));
    }

    let header = String::from_utf8_lossy(&data[header_start..data_offset]);
    if header.contains("'fortran_order': True") {
        return Err(TtsError::TableParse(format!(
            "{name}: fortran-ordered arrays are not supported"
        )));
    }

    let payload = &data[data_offset..];
    if header.contains("'<i2'") {
        if payload.len() % 2 != 0 {
            return Err(TtsError::TableParse(format!(
                "{name}: int16 data length {} is odd",
                payload.len()
            )));
        }
        Ok(NpyData::I16(
            payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
        ))
    } else if header.contains("'<f4'") {
        if payload.len() % 4 != 0 {
            return Err(TtsError::TableParse(format!(
                "{name}: float data length {} is not a multiple of 4",
                payload.len()
            )));
        }
        Ok(NpyData::F32(
            payload
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ))
    } else {
        Err(TtsError::TableParse(format!(
            "{name}: only '<i2' and '<f4' dtypes are supported"
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal v1 `.npy` encoder for fixtures.
    pub(crate) fn npy_bytes(descr: &str, len: usize, payload: &[u8]) -> Vec<u8> {
        let mut header = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': ({len},), }}");
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut out = b"\x93NUMPY\x01\x00".to_vec();
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn npy_i16(values: &[i16]) -> Vec<u8> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        npy_bytes("<i2", values.len(), &payload)
    }

    pub(crate) fn npy_f32(values: &[f32]) -> Vec<u8> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        npy_bytes("<f4", values.len(), &payload)
    }

    pub(crate) fn write_npz(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, bytes) in entries {
            zip.start_file(format!("{name}.npy"), options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    fn bins(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 - n as f32 / 2.0).collect()
    }

    #[test]
    fn parses_int16_and_float_npy() {
        let parsed = parse_npy(&npy_i16(&[1, -2, 300]), "a.npy").unwrap();
        assert_eq!(parsed, NpyData::I16(vec![1, -2, 300]));
        let parsed = parse_npy(&npy_f32(&[0.5, -1.25]), "b.npy").unwrap();
        assert_eq!(parsed, NpyData::F32(vec![0.5, -1.25]));
    }

    #[test]
    fn rejects_bad_magic_and_dtype() {
        let mut bytes = npy_i16(&[1]);
        bytes[1] = b'X';
        assert!(parse_npy(&bytes, "x.npy").is_err());
        let bytes = npy_bytes("<f8", 1, &[0u8; 8]);
        assert!(parse_npy(&bytes, "x.npy").is_err());
    }

    #[test]
    fn binned_embedding_validates_bins() {
        let table = EmbeddingTable::new(vec![0; 4 * DIM_FEAT], DIM_FEAT).unwrap();
        assert!(BinnedEmbedding::new(table.clone(), bins(2)).is_err());
        assert!(BinnedEmbedding::new(table.clone(), vec![0.0, -1.0, 2.0]).is_err());
        let binned = BinnedEmbedding::new(table, bins(3)).unwrap();
        assert_eq!(binned.num_embeds(), 4);
    }

    #[test]
    fn lookup_returns_the_binned_row() {
        let weights: Vec<i16> = (0..3).flat_map(|r| vec![r as i16 * 10; DIM_FEAT]).collect();
        let table = EmbeddingTable::new(weights, DIM_FEAT).unwrap();
        let binned = BinnedEmbedding::new(table, vec![0.0, 1.0]).unwrap();
        let (bin, row) = binned.lookup(0.5);
        assert_eq!(bin, 1);
        assert!(row.iter().all(|&v| v == 10));
        assert_eq!(binned.lookup(7.0).0, 2);
    }

    #[test]
    fn embedding_row_out_of_range_is_none() {
        let table = EmbeddingTable::new(vec![1; 2 * DIM_FEAT_INPUT], DIM_FEAT_INPUT).unwrap();
        assert!(table.row(1).is_some());
        assert!(table.row(2).is_none());
    }

    #[test]
    fn loads_tables_from_npz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.npz");
        write_npz(
            &path,
            &[
                ("input_embed", npy_i16(&vec![3; 4 * DIM_FEAT_INPUT])),
                ("pitch_embed", npy_i16(&vec![1; 4 * DIM_FEAT])),
                ("pitch_bins", npy_f32(&bins(3))),
                ("energy_embed", npy_i16(&vec![2; 8 * DIM_FEAT])),
                ("energy_bins", npy_f32(&bins(7))),
                ("mel_inverse", npy_f32(&vec![0.0; NUM_FFT_BINS * NUM_MELS])),
            ],
        );

        let tables = FuseTables::load(&path).unwrap();
        assert_eq!(tables.input_embed.rows(), 4);
        assert_eq!(tables.pitch.num_embeds(), 4);
        assert_eq!(tables.energy.num_embeds(), 8);
    }

    #[test]
    fn missing_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.npz");
        write_npz(&path, &[("pitch_bins", npy_f32(&bins(3)))]);
        let err = FuseTables::load(&path).unwrap_err();
        assert!(err.to_string().contains("input_embed"));
    }
}
