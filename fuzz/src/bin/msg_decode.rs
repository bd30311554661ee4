#[macro_use]
extern crate afl;
use vault_e2ee::Envelope;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = Envelope::decode(data) {
            // Whatever decodes must encode back to the same bytes.
            assert_eq!(envelope.encode().ok().as_deref(), Some(data));
        }
    });
}
