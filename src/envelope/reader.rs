use crate::{Error, X25519PublicKey};

/// Bounds-checked cursor over an encoded envelope.
pub(super) struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub(super) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], Error> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::MalformedEnvelope(format!("truncated {what}")))?;

        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub(super) fn read_u8(&mut self, what: &str) -> Result<u8, Error> {
        Ok(self.read_array::<1>(what)?[0])
    }

    pub(super) fn read_u32(&mut self, what: &str) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.read_array::<4>(what)?))
    }

    pub(super) fn read_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    /// Reads an X25519 public key, rejecting encodings with the unused top bit
    /// set so that every accepted key has exactly one byte representation.
    pub(super) fn read_public_key(&mut self, what: &str) -> Result<X25519PublicKey, Error> {
        let bytes = self.read_array::<32>(what)?;
        if bytes[31] & 0x80 != 0 {
            return Err(Error::MalformedEnvelope(format!("non-canonical {what}")));
        }
        Ok(X25519PublicKey::from(bytes))
    }

    /// Reads a `u32` length prefix followed by that many bytes.
    pub(super) fn read_prefixed(&mut self, what: &str) -> Result<&'a [u8], Error> {
        let len = self.read_u32(what)?;
        let len = usize::try_from(len)
            .map_err(|_| Error::MalformedEnvelope(format!("{what} length out of range")))?;
        self.take(len, what)
    }

    /// Fails if anything is left over.
    pub(super) fn finish(self) -> Result<(), Error> {
        if self.position == self.bytes.len() {
            Ok(())
        } else {
            Err(Error::MalformedEnvelope(format!(
                "{} trailing bytes",
                self.bytes.len() - self.position
            )))
        }
    }
}
