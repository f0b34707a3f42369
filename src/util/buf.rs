use bytes::{Buf, BufMut, Bytes};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Fixed-size and length-prefixed reads that report underflow as an error instead of panicking
pub trait BufExt: Buf {
    fn try_get_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            anyhow::bail!("buffer underflow: expected {} bytes, got {}", N, self.remaining());
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// reads a blob prefixed with its length as a big-endian u16
    fn try_get_u16_prefixed(&mut self) -> anyhow::Result<Bytes> {
        let len: usize = self.try_get_u16()?.safe_cast();
        if self.remaining() < len {
            anyhow::bail!("buffer underflow: expected {} bytes, got {}", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }
}

pub trait BufMutExt: BufMut {
    /// NB: panics for blobs longer than u16::MAX - callers must have checked
    fn put_u16_prefixed(&mut self, data: &[u8]) {
        self.put_u16(data.len().prechecked_cast());
        self.put_slice(data);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
