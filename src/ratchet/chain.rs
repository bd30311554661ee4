use crate::Error;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Symmetric-key ratchet for one direction of a session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Chain {
    pub(crate) chain_key: Box<[u8; 32]>,
    pub(crate) index: u32,
}

impl Chain {
    pub(crate) fn new(chain_key: Box<[u8; 32]>) -> Self {
        Self {
            chain_key,
            index: 0,
        }
    }

    /// Advances the chain and returns the message key for the current index.
    ///
    /// The previous chain key is overwritten, so earlier message keys cannot be
    /// rederived from the chain.
    pub(crate) fn next(&mut self) -> Result<Box<[u8; 32]>, Error> {
        let chain_result = Self::mac(&self.chain_key, 0x01)?;
        let message_result = Self::mac(&self.chain_key, 0x02)?;

        self.chain_key.copy_from_slice(&chain_result);
        self.index = self.index.wrapping_add(1);

        let mut message_key = Box::new([0u8; 32]);
        message_key.copy_from_slice(&message_result);
        Ok(message_key)
    }

    fn mac(key: &[u8; 32], constant: u8) -> Result<[u8; 32], Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_slice())
            .map_err(|err| Error::Crypto(err.to_string()))?;
        mac.update(&[constant]);

        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }
}
