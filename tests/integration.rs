#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use vault_e2ee::{
        Account, AccountConfig, Device, DeviceFanout, Envelope, Error, FanoutConfig,
        MemoryPreKeyDirectory, MemorySessionStore, OsEntropy, PreKeyBundle, PreKeyDirectory,
        SessionEngine, SessionState, StorageKey,
    };

    async fn new_account(user_id: &str, device_id: u32) -> Account<MemorySessionStore> {
        new_account_with(user_id, device_id, AccountConfig::default()).await
    }

    async fn new_account_with(
        user_id: &str,
        device_id: u32,
        config: AccountConfig,
    ) -> Account<MemorySessionStore> {
        Account::create(
            user_id,
            device_id,
            MemorySessionStore::new(),
            StorageKey::generate(&OsEntropy).unwrap(),
            config,
        )
        .await
        .unwrap()
    }

    /// Sends `plaintext` from `sender` to `recipient` through the wire format.
    async fn relay<A: SessionEngine, B: SessionEngine>(
        sender: &A,
        recipient: &B,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let envelope = sender
            .encrypt(recipient.local_user_id(), recipient.local_device_id(), plaintext)
            .await?;
        let wire = envelope.encode()?;
        recipient
            .decrypt(
                sender.local_user_id(),
                sender.local_device_id(),
                &Envelope::decode(&wire)?,
            )
            .await
    }

    #[tokio::test]
    async fn test_full_protocol_flow() {
        println!("Step 1: Creating accounts for Alice and Bob...");
        let alice = new_account("alice", 1).await;
        let bob = new_account("bob", 1).await;
        let directory = MemoryPreKeyDirectory::new();

        println!("Step 2: Bob publishes his pre-keys...");
        bob.publish_to(&directory).await.unwrap();

        println!("Step 3: Alice fetches and verifies Bob's bundle...");
        let bundle = directory.fetch("bob", 1).await.unwrap();
        assert!(bundle.verify().is_ok(), "Bundle verification failed");
        assert!(bundle.one_time_pre_key.is_some());

        println!("Step 4: Alice initiates the session...");
        assert_eq!(
            alice.session_state("bob", 1).await.unwrap(),
            SessionState::NoSession
        );
        alice.initiate_session("bob", &bundle).await.unwrap();
        assert_eq!(
            alice.session_state("bob", 1).await.unwrap(),
            SessionState::Pending
        );

        println!("Step 5: Alice sends the first message...");
        let envelope = alice.encrypt("bob", 1, b"hi").await.unwrap();
        assert!(matches!(envelope, Envelope::PreKeyHandshake(_)));
        assert_eq!(
            alice.session_state("bob", 1).await.unwrap(),
            SessionState::Established
        );

        println!("Step 6: Bob accepts the handshake...");
        let wire = envelope.encode().unwrap();
        assert_eq!(
            bob.session_state("alice", 1).await.unwrap(),
            SessionState::NoSession
        );
        let plaintext = bob
            .decrypt("alice", 1, &Envelope::decode(&wire).unwrap())
            .await
            .unwrap();
        assert_eq!(plaintext, b"hi");
        assert_eq!(
            bob.session_state("alice", 1).await.unwrap(),
            SessionState::Established
        );

        println!("Step 7: Bob replies...");
        let reply = bob.encrypt("alice", 1, b"hello alice").await.unwrap();
        assert!(matches!(reply, Envelope::Ratchet(_)));
        assert_eq!(
            alice.decrypt("bob", 1, &reply).await.unwrap(),
            b"hello alice"
        );

        println!("Step 8: Out-of-order delivery...");
        let m1 = alice.encrypt("bob", 1, b"m1").await.unwrap();
        let m2 = alice.encrypt("bob", 1, b"m2").await.unwrap();
        let m3 = alice.encrypt("bob", 1, b"m3").await.unwrap();
        assert!(matches!(m1, Envelope::Ratchet(_)));

        assert_eq!(bob.decrypt("alice", 1, &m3).await.unwrap(), b"m3");
        assert_eq!(bob.decrypt("alice", 1, &m1).await.unwrap(), b"m1");
        assert_eq!(bob.decrypt("alice", 1, &m2).await.unwrap(), b"m2");

        println!("Step 9: Several ratchet rotations...");
        for i in 0..5 {
            let from_bob = format!("bob {i}");
            assert_eq!(
                relay(&bob, &alice, from_bob.as_bytes()).await.unwrap(),
                from_bob.as_bytes()
            );
            let from_alice = format!("alice {i}");
            assert_eq!(
                relay(&alice, &bob, from_alice.as_bytes()).await.unwrap(),
                from_alice.as_bytes()
            );
        }

        println!("Step 10: Both sides compute the same safety number...");
        let alice_view = alice.fingerprint("bob", &bob.identity_public_key());
        let bob_view = bob.fingerprint("alice", &alice.identity_public_key());
        assert_eq!(alice_view, bob_view);
        assert_eq!(alice_view.digits().len(), 60);

        println!("All integration tests passed successfully!");
    }

    #[tokio::test]
    async fn test_replay_and_tampering() {
        let alice = new_account("alice", 1).await;
        let bob = new_account("bob", 1).await;

        alice
            .initiate_session("bob", &bob.current_bundle().unwrap())
            .await
            .unwrap();
        assert_eq!(relay(&alice, &bob, b"hello").await.unwrap(), b"hello");
        assert_eq!(relay(&bob, &alice, b"ack").await.unwrap(), b"ack");

        println!("Replaying a delivered message...");
        let envelope = alice.encrypt("bob", 1, b"once").await.unwrap();
        assert_eq!(bob.decrypt("alice", 1, &envelope).await.unwrap(), b"once");
        assert_eq!(
            bob.decrypt("alice", 1, &envelope).await,
            Err(Error::AuthenticationFailed)
        );

        println!("Flipping a bit in the ciphertext...");
        let envelope = alice.encrypt("bob", 1, b"authentic").await.unwrap();
        let mut wire = envelope.encode().unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;
        let tampered = Envelope::decode(&wire).unwrap();
        assert_eq!(
            bob.decrypt("alice", 1, &tampered).await,
            Err(Error::AuthenticationFailed)
        );

        println!("The untouched message still decrypts...");
        assert_eq!(
            bob.decrypt("alice", 1, &envelope).await.unwrap(),
            b"authentic"
        );

        println!("Trailing bytes are rejected...");
        let mut wire = envelope.encode().unwrap();
        wire.push(0);
        assert!(matches!(
            Envelope::decode(&wire),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn test_forged_bundle_is_rejected() {
        let alice = new_account("alice", 1).await;
        let bob = new_account("bob", 1).await;
        let mallory = new_account("mallory", 1).await;

        let mut forged: PreKeyBundle = bob.current_bundle().unwrap();
        let mallory_bundle = mallory.current_bundle().unwrap();
        forged.signed_pre_key = mallory_bundle.signed_pre_key;

        let result = alice.initiate_session("bob", &forged).await;
        assert!(matches!(result, Err(Error::UntrustedPreKey(_))));
        assert_eq!(
            alice.session_state("bob", 1).await.unwrap(),
            SessionState::NoSession
        );

        // Nothing was pinned by the failed attempt.
        assert!(alice.trusted_identity("bob").is_none());
    }

    #[tokio::test]
    async fn test_changed_identity_needs_explicit_trust() {
        let alice = new_account("alice", 1).await;
        let bob = new_account("bob", 1).await;

        alice
            .initiate_session("bob", &bob.current_bundle().unwrap())
            .await
            .unwrap();
        relay(&alice, &bob, b"first contact").await.unwrap();

        println!("Bob reinstalls and comes back with a new identity...");
        let reinstalled = new_account("bob", 1).await;
        let envelope_from_new_bob = {
            reinstalled
                .initiate_session("alice", &alice.current_bundle().unwrap())
                .await
                .unwrap();
            reinstalled.encrypt("alice", 1, b"it's me").await.unwrap()
        };

        assert_eq!(
            alice.decrypt("bob", 1, &envelope_from_new_bob).await,
            Err(Error::UntrustedIdentity("bob".to_string()))
        );

        println!("Alice verifies the new key and accepts it...");
        alice
            .trust_identity("bob", &reinstalled.identity_public_key())
            .await
            .unwrap();
        assert_eq!(
            alice.decrypt("bob", 1, &envelope_from_new_bob).await.unwrap(),
            b"it's me"
        );

        alice
            .mark_verified("bob", &reinstalled.identity_public_key())
            .await
            .unwrap();
        assert!(alice.trusted_identity("bob").unwrap().verified);
    }

    #[tokio::test]
    async fn test_sessions_survive_restart() {
        let alice_store = MemorySessionStore::new();
        let bob_store = MemorySessionStore::new();
        let alice_key = StorageKey::generate(&OsEntropy).unwrap();
        let bob_key = StorageKey::generate(&OsEntropy).unwrap();

        let alice = Account::create(
            "alice",
            1,
            alice_store.clone(),
            alice_key.clone(),
            AccountConfig::default(),
        )
        .await
        .unwrap();
        let bob = Account::create(
            "bob",
            7,
            bob_store.clone(),
            bob_key.clone(),
            AccountConfig::default(),
        )
        .await
        .unwrap();

        println!("Establishing the session...");
        alice
            .initiate_session("bob", &bob.current_bundle().unwrap())
            .await
            .unwrap();
        relay(&alice, &bob, b"before restart").await.unwrap();
        relay(&bob, &alice, b"ack").await.unwrap();

        // One message is still in flight across the restart.
        let in_flight = alice.encrypt("bob", 7, b"in flight").await.unwrap();
        let bob_identity = bob.identity_public_key();
        drop(alice);
        drop(bob);

        println!("Restoring both accounts from storage...");
        let alice = Account::open(
            "alice",
            alice_store.clone(),
            alice_key,
            AccountConfig::default(),
        )
        .await
        .unwrap()
        .unwrap();
        let bob = Account::open("bob", bob_store.clone(), bob_key, AccountConfig::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(bob.identity_public_key(), bob_identity);
        assert_eq!(bob.local_device_id(), 7);
        assert_eq!(
            alice.session_state("bob", 7).await.unwrap(),
            SessionState::Established
        );
        assert!(alice.trusted_identity("bob").is_some());

        println!("Continuing the conversation...");
        assert_eq!(
            bob.decrypt("alice", 1, &in_flight).await.unwrap(),
            b"in flight"
        );
        assert_eq!(
            relay(&bob, &alice, b"after restart").await.unwrap(),
            b"after restart"
        );
        assert_eq!(
            relay(&alice, &bob, b"still here").await.unwrap(),
            b"still here"
        );

        println!("The store only ever sees sealed records...");
        let needle = bob_identity.to_bytes();
        for key in alice_store.keys() {
            let raw = alice_store.raw(&key).unwrap();
            assert!(!raw.windows(needle.len()).any(|window| window == needle));
        }
    }

    #[tokio::test]
    async fn test_one_time_pre_key_exhaustion() {
        let config = AccountConfig {
            min_one_time_pre_keys: 0,
            max_one_time_pre_keys: 1,
            ..AccountConfig::default()
        };
        let bob = new_account_with("bob", 1, config).await;
        let alice = new_account("alice", 1).await;
        let carol = new_account("carol", 1).await;
        let directory = MemoryPreKeyDirectory::new();
        bob.publish_to(&directory).await.unwrap();

        let first = directory.fetch("bob", 1).await.unwrap();
        let second = directory.fetch("bob", 1).await.unwrap();
        assert!(first.one_time_pre_key.is_some());
        assert!(second.one_time_pre_key.is_none());
        assert!(second.verify().is_ok());

        alice.initiate_session("bob", &first).await.unwrap();
        carol.initiate_session("bob", &second).await.unwrap();

        assert_eq!(relay(&alice, &bob, b"from alice").await.unwrap(), b"from alice");
        assert_eq!(relay(&carol, &bob, b"from carol").await.unwrap(), b"from carol");
        assert_eq!(bob.pre_keys().one_time_count(), 0);

        // Republishing never offers the consumed key again.
        bob.publish_to(&directory).await.unwrap();
        assert_eq!(directory.one_time_available("bob", 1), 0);
    }

    #[tokio::test]
    async fn test_rotated_signed_pre_key_serves_in_flight_handshakes() {
        let bob = new_account("bob", 1).await;
        let alice = new_account("alice", 1).await;
        let carol = new_account("carol", 1).await;

        let alice_bundle = bob.current_bundle().unwrap();
        let carol_bundle = bob.current_bundle().unwrap();

        let later = SystemTime::now() + Duration::from_secs(8 * 24 * 60 * 60);
        let rotated = bob.rotate_signed_pre_key_if_due(later).await.unwrap();
        assert!(rotated.is_some());
        assert_ne!(
            bob.current_bundle().unwrap().signed_pre_key_id,
            alice_bundle.signed_pre_key_id
        );

        println!("A handshake against the previous key still works...");
        alice.initiate_session("bob", &alice_bundle).await.unwrap();
        assert_eq!(relay(&alice, &bob, b"in time").await.unwrap(), b"in time");

        println!("After retention the previous key is gone...");
        let much_later = later + Duration::from_secs(15 * 24 * 60 * 60);
        bob.rotate_signed_pre_key_if_due(much_later).await.unwrap();

        carol.initiate_session("bob", &carol_bundle).await.unwrap();
        let envelope = carol.encrypt("bob", 1, b"too late").await.unwrap();
        assert!(matches!(
            bob.decrypt("carol", 1, &envelope).await,
            Err(Error::PreKey(_))
        ));
    }

    #[tokio::test]
    async fn test_fanout_reports_each_device() {
        let alice = new_account("alice", 1).await;
        let directory = MemoryPreKeyDirectory::new();

        println!("Bob registers three devices; only two publish bundles...");
        let bob_phone = new_account("bob", 1).await;
        let bob_laptop = new_account("bob", 2).await;
        let _bob_tablet = new_account("bob", 3).await;
        bob_phone.publish_to(&directory).await.unwrap();
        bob_laptop.publish_to(&directory).await.unwrap();

        let fanout = DeviceFanout::new(alice, directory.clone(), FanoutConfig::default());
        fanout.add_device(Device::new("bob", 1).with_name("Phone")).unwrap();
        fanout.add_device(Device::new("bob", 2).with_name("Laptop")).unwrap();
        fanout.add_device(Device::new("bob", 3).with_name("Tablet")).unwrap();

        println!("Alice sends one logical message...");
        let deliveries = fanout.send("bob", b"to every device").await.unwrap();
        assert_eq!(deliveries.len(), 3);
        assert_eq!(deliveries.iter().filter(|d| d.result.is_ok()).count(), 2);

        let failed = deliveries.iter().find(|d| d.device_id == 3).unwrap();
        assert!(matches!(failed.result, Err(Error::BundleUnavailable(_))));

        println!("Each published device decrypts its own copy...");
        let phone = DeviceFanout::new(bob_phone, directory.clone(), FanoutConfig::default());
        let laptop = DeviceFanout::new(bob_laptop, directory.clone(), FanoutConfig::default());

        for (receiver, device_id) in [(&phone, 1), (&laptop, 2)] {
            let delivery = deliveries.iter().find(|d| d.device_id == device_id).unwrap();
            let bytes = delivery.result.as_ref().unwrap();
            assert_eq!(
                receiver.receive("alice", 1, bytes).await.unwrap(),
                b"to every device"
            );

            // The sender's device is learned from the handshake.
            let devices = receiver.devices("alice");
            assert_eq!(devices.len(), 1);
            assert_eq!(
                devices[0].identity,
                Some(fanout.engine().identity_public_key())
            );

            // An echo of the same message is filtered.
            assert_eq!(
                receiver.receive("alice", 1, bytes).await,
                Err(Error::DuplicateMessage)
            );
        }

        println!("Unknown senders and garbage are rejected...");
        assert!(matches!(
            phone.receive("alice", 1, &[1, 2, 3]).await,
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            fanout.send("nobody", b"?").await,
            Err(Error::UnknownRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_fanout_device_limit() {
        let alice = new_account("alice", 1).await;
        let config = FanoutConfig {
            max_devices: 2,
            ..FanoutConfig::default()
        };
        let fanout = DeviceFanout::new(alice, MemoryPreKeyDirectory::new(), config);

        fanout.add_device(Device::new("bob", 1)).unwrap();
        fanout.add_device(Device::new("bob", 2)).unwrap();
        assert_eq!(
            fanout.add_device(Device::new("bob", 3)),
            Err(Error::DeviceLimitExceeded { limit: 2 })
        );

        fanout.remove_device("bob", 1).await.unwrap();
        assert!(fanout.add_device(Device::new("bob", 3)).is_ok());
        assert_eq!(fanout.devices("bob").len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_unlink() {
        let directory = MemoryPreKeyDirectory::new();
        let bob_phone = new_account("bob", 1).await;
        let bob_laptop = new_account("bob", 2).await;
        bob_phone.publish_to(&directory).await.unwrap();
        bob_laptop.publish_to(&directory).await.unwrap();

        let alice = new_account("alice", 1).await;
        let fanout = DeviceFanout::new(alice, directory.clone(), FanoutConfig::default());
        fanout.add_device(Device::new("bob", 1)).unwrap();
        fanout.add_device(Device::new("bob", 2)).unwrap();

        println!("Alice talks to both of Bob's devices...");
        let deliveries = fanout.send("bob", b"hello").await.unwrap();
        assert!(deliveries.iter().all(|d| d.result.is_ok()));
        for device_id in [1, 2] {
            assert_eq!(
                fanout.engine().session_state("bob", device_id).await.unwrap(),
                SessionState::Established
            );
        }

        println!("Alice unlinks Bob...");
        let removed = fanout.unlink("bob").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(fanout.conversation("bob").is_none());
        assert!(fanout.devices("bob").is_empty());
        for device_id in [1, 2] {
            assert_eq!(
                fanout.engine().session_state("bob", device_id).await.unwrap(),
                SessionState::NoSession
            );
        }
        assert!(matches!(
            fanout.send("bob", b"gone").await,
            Err(Error::UnknownRecipient(_))
        ));

        // Unlinking again is harmless.
        assert!(fanout.unlink("bob").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions() {
        let alice = Arc::new(new_account("alice", 1).await);

        println!("Alice talks to eight peers in parallel...");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let alice = Arc::clone(&alice);
                tokio::spawn(async move {
                    let peer_id = format!("peer-{i}");
                    let peer = new_account(&peer_id, 1).await;

                    alice
                        .initiate_session(&peer_id, &peer.current_bundle().unwrap())
                        .await
                        .unwrap();
                    for round in 0..5 {
                        let outbound = format!("to {peer_id} #{round}");
                        assert_eq!(
                            relay(alice.as_ref(), &peer, outbound.as_bytes()).await.unwrap(),
                            outbound.as_bytes()
                        );
                        let inbound = format!("from {peer_id} #{round}");
                        assert_eq!(
                            relay(&peer, alice.as_ref(), inbound.as_bytes()).await.unwrap(),
                            inbound.as_bytes()
                        );
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_decrypts_on_one_session() {
        let alice = new_account("alice", 1).await;
        let bob = Arc::new(new_account("bob", 1).await);

        alice
            .initiate_session("bob", &bob.current_bundle().unwrap())
            .await
            .unwrap();

        let mut envelopes = Vec::new();
        for i in 0..20 {
            let envelope = alice.encrypt("bob", 1, format!("m{i}").as_bytes()).await;
            envelopes.push((i, envelope.unwrap()));
        }
        envelopes.reverse();

        println!("Bob decrypts twenty messages from parallel tasks...");
        let handles: Vec<_> = envelopes
            .into_iter()
            .map(|(i, envelope)| {
                let bob = Arc::clone(&bob);
                tokio::spawn(async move {
                    let plaintext = bob.decrypt("alice", 1, &envelope).await.unwrap();
                    assert_eq!(plaintext, format!("m{i}").as_bytes());
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            relay(bob.as_ref(), &alice, b"all received").await.unwrap(),
            b"all received"
        );
    }
}
