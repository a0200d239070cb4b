use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

const READ_BUF_SIZE: usize = 1024 * 1024;

/// Stable content hash of a local file, computed as a streaming MD5 over
/// the whole byte range so files larger than memory are never fully
/// buffered. The value is never compared against anything but another
/// value this same function produced, so the choice of algorithm is an
/// implementation detail, not a wire contract.
pub fn checksum(absolute_path: &Path) -> Result<String> {
    let mut file = File::open(absolute_path)
        .with_context(|| format!("open {} for checksum", absolute_path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {} while hashing", absolute_path.display()))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}
