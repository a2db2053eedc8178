use std::time::Duration;

use crypto::{CryptManager, PrivateIdentity, PublicIdentity};
use proto::{MAX_OBJECT_TTL, MessageContent, ObjectKind, ObjectRecord, ObjectTemplate, StreamId};
use tracing::debug;

use crate::error::ComposeError;

/// Signs, encrypts and seals `body` for `recipient` as a `Msg` object.
///
/// Runs the proof-of-work search on the calling thread.
pub fn seal_message(
    crypt: &dyn CryptManager,
    sender: &PrivateIdentity,
    recipient: &PublicIdentity,
    body: &[u8],
    stream: StreamId,
    ttl: Duration,
) -> Result<ObjectRecord, ComposeError> {
    let ttl_secs = ttl.as_secs();
    if ttl_secs == 0 || ttl_secs > MAX_OBJECT_TTL as u64 {
        return Err(ComposeError::InvalidTtl(ttl_secs));
    }

    let destination = recipient.ripe();
    let preimage = MessageContent::signing_preimage(&destination, sender.public(), body);
    let content = MessageContent {
        destination,
        sender: sender.public().clone(),
        body: body.to_vec(),
        signature: crypt.sign(sender, &preimage),
    };
    let envelope = crypt.encrypt(recipient, &codec::to_vec(&content)?)?;

    let template = ObjectTemplate {
        expires: chrono::Utc::now().timestamp() + ttl_secs as i64,
        kind: ObjectKind::Msg,
        stream,
        payload: codec::to_vec(&envelope)?,
    };
    let pow_payload = template.pow_payload()?;
    debug!(
        len = pow_payload.len(),
        target = crypt.pow_target(pow_payload.len()),
        "sealing message"
    );
    let nonce = crypt.do_pow(&pow_payload)?;
    Ok(template.seal(nonce)?)
}

#[cfg(test)]
mod tests {
    use crypto::{Envelope, PowParams, PowSettings, StandardCrypt};

    use super::*;

    fn crypt() -> StandardCrypt {
        StandardCrypt::new(PowSettings {
            params: PowParams {
                trials_per_byte: 2,
                extra_bytes: 0,
            },
            workers: 2,
            target_load: 1.0,
            batch_size: 256,
        })
    }

    #[test]
    fn sealed_message_opens_for_the_recipient_only() {
        let crypt = crypt();
        let alice = PrivateIdentity::generate();
        let bob = PrivateIdentity::generate();
        let object = seal_message(
            &crypt,
            &alice,
            bob.public(),
            b"hi bob",
            1,
            Duration::from_secs(3600),
        )
        .expect("seal");

        assert_eq!(object.kind(), ObjectKind::Msg);
        assert!(object.has_valid_pow(&crypt));

        let envelope: Envelope = codec::from_slice(object.payload()).expect("envelope");
        assert!(!crypt.check_mac(&alice, &envelope));
        let plaintext = crypt.decrypt(&bob, &envelope).expect("decrypt");
        let content: MessageContent = codec::from_slice(&plaintext).expect("content");
        assert_eq!(content.destination, bob.ripe());
        assert_eq!(content.body, b"hi bob");
        assert!(crypt.verify(&content.sender, &content.preimage(), &content.signature));
    }

    #[test]
    fn ttl_must_be_within_bounds() {
        let crypt = crypt();
        let alice = PrivateIdentity::generate();
        for ttl in [0, MAX_OBJECT_TTL as u64 + 1] {
            assert!(matches!(
                seal_message(&crypt, &alice, alice.public(), b"", 1, Duration::from_secs(ttl)),
                Err(ComposeError::InvalidTtl(_))
            ));
        }
    }
}
