//! Raw f32 tensor files used by the CLI for latents and decoded frames.
//!
//! Format (little-endian):
//! - magic: `b"PFT1"`
//! - ndims: u64
//! - dims: ndims * u64
//! - data: f32 * product(dims), row-major

use candle_core::{DType, Device, Result, Tensor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"PFT1";
const MAX_DIMS: usize = 8;

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_tensor(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        candle_core::bail!("{} is not a tensor file (bad magic)", path.display());
    }
    let ndims = read_u64(&mut reader)? as usize;
    if ndims == 0 || ndims > MAX_DIMS {
        candle_core::bail!("{}: unsupported rank {ndims}", path.display());
    }
    let dims = (0..ndims)
        .map(|_| read_u64(&mut reader).map(|d| d as usize))
        .collect::<Result<Vec<_>>>()?;

    let Some(byte_len) = dims.iter().try_fold(4usize, |acc, &d| acc.checked_mul(d)) else {
        candle_core::bail!("{}: dims {dims:?} overflow", path.display());
    };
    let header_len = (MAGIC.len() + 8 * (ndims + 1)) as u64;
    if file_len.checked_sub(header_len) != Some(byte_len as u64) {
        candle_core::bail!(
            "{}: header dims {dims:?} need {byte_len} data bytes, file has {}",
            path.display(),
            file_len.saturating_sub(header_len)
        );
    }
    let mut bytes = vec![0u8; byte_len];
    reader.read_exact(&mut bytes)?;
    let mut trailing = [0u8; 1];
    if reader.read(&mut trailing)? != 0 {
        candle_core::bail!("{}: data longer than header dims {dims:?}", path.display());
    }

    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Tensor::from_vec(data, dims, device)
}

pub fn write_tensor(path: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&(tensor.rank() as u64).to_le_bytes())?;
    for d in tensor.dims() {
        writer.write_all(&(*d as u64).to_le_bytes())?;
    }

    let data = tensor
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    for v in data {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}
