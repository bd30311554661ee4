use crate::ratchet::chain::Chain;
use crate::{X25519PublicKey, X25519Secret};
use zeroize::Zeroize;

/// `initiator identity || responder identity`
pub(crate) const AD_LEN: usize = 128;

#[derive(Clone)]
pub(crate) struct RatchetState {
    pub(crate) dh_pair: X25519Secret,
    pub(crate) remote_dh_key_public: Option<X25519PublicKey>,

    pub(crate) root_key: Box<[u8; 32]>,
    pub(crate) sending_chain: Option<Chain>,
    pub(crate) receiving_chain: Option<Chain>,

    pub(crate) previous_sending_chain_length: u32,

    pub(crate) ad: Box<[u8; AD_LEN]>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}
