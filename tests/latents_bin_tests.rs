use candle_core::{DType, Device, Result, Tensor};
use pyramid_flow::latents_bin::{read_tensor, write_tensor};
use std::io::Write;

#[test]
fn test_latents_bin_roundtrip_f32() -> Result<()> {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    let path = tmp.path();

    let input = Tensor::randn(0f32, 1.0, (1, 16, 2, 4, 5), &device)?;
    write_tensor(path, &input)?;

    let loaded = read_tensor(path, &device)?;
    assert_eq!(loaded.dims(), input.dims());
    assert_eq!(loaded.dtype(), DType::F32);

    let diff = input.sub(&loaded)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6, "max diff {diff}");
    Ok(())
}

#[test]
fn test_latents_bin_writes_bf16_as_f32() -> Result<()> {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");

    let input = Tensor::new(&[[0.5f32, -1.25], [2.0, 0.0]], &device)?.to_dtype(DType::BF16)?;
    write_tensor(tmp.path(), &input)?;

    let loaded = read_tensor(tmp.path(), &device)?;
    assert_eq!(loaded.to_vec2::<f32>()?, vec![vec![0.5, -1.25], vec![2.0, 0.0]]);
    // magic + rank + 2 dims + 4 values
    let len = std::fs::metadata(tmp.path())?.len();
    assert_eq!(len, 4 + 8 + 16 + 16);
    Ok(())
}

#[test]
fn test_latents_bin_rejects_bad_magic() -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(b"NOPE")?;
    tmp.write_all(&1u64.to_le_bytes())?;
    tmp.flush()?;
    assert!(read_tensor(tmp.path(), &Device::Cpu).is_err());
    Ok(())
}

#[test]
fn test_latents_bin_rejects_length_mismatch() -> Result<()> {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    write_tensor(tmp.path(), &Tensor::ones((2, 3), DType::F32, &device)?)?;

    let mut bytes = std::fs::read(tmp.path())?;
    bytes.extend_from_slice(&1f32.to_le_bytes());
    std::fs::write(tmp.path(), &bytes)?;
    assert!(read_tensor(tmp.path(), &device).is_err());

    bytes.truncate(bytes.len() - 8);
    std::fs::write(tmp.path(), &bytes)?;
    assert!(read_tensor(tmp.path(), &device).is_err());
    Ok(())
}

#[test]
fn test_latents_bin_rejects_oversized_dims() -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(b"PFT1")?;
    tmp.write_all(&2u64.to_le_bytes())?;
    tmp.write_all(&u64::MAX.to_le_bytes())?;
    tmp.write_all(&2u64.to_le_bytes())?;
    tmp.write_all(&1f32.to_le_bytes())?;
    tmp.flush()?;
    assert!(read_tensor(tmp.path(), &Device::Cpu).is_err());

    // fits in usize but far larger than the file
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(b"PFT1")?;
    tmp.write_all(&1u64.to_le_bytes())?;
    tmp.write_all(&(1u64 << 40).to_le_bytes())?;
    tmp.flush()?;
    assert!(read_tensor(tmp.path(), &Device::Cpu).is_err());
    Ok(())
}

#[test]
fn test_latents_bin_rejects_zero_rank() -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(b"PFT1")?;
    tmp.write_all(&0u64.to_le_bytes())?;
    tmp.flush()?;
    assert!(read_tensor(tmp.path(), &Device::Cpu).is_err());
    Ok(())
}
