#[cfg(test)]
mod tests {
    use bsync::blob::{Blob, Fingerprint};
    use bsync::config::{SyncConfig, VerifyPolicy};
    use bsync::container::Reference;
    use bsync::iprog::{compile_from_segments, hash16, IProg, Segment, Window};
    use bsync::sync::protocol::{self, Ack, ControlMsg};
    use bsync::sync::receiver::{MemoryWindowCache, NoCache};
    use bsync::sync::{receive_blob, send_blob, BlueprintSender, SendReport, SyncReceiver};
    use sha2::{Digest, Sha256};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const BLOB_SIZE: u64 = 1 << 20;

    fn shared_blob() -> Arc<Blob> {
        let mut blob = Blob::in_memory(Fingerprint::new("t", BLOB_SIZE, 1337, "prand"));
        blob.ensure_filled().unwrap();
        Arc::new(blob)
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            need_timeout: Duration::from_millis(200),
            recv_timeout: Duration::from_secs(5),
            bucket_wait_timeout: Duration::from_secs(5),
            ..SyncConfig::default()
        }
    }

    /// Compile an object that lives in the blob as a list of segments.
    fn segment_object(blob: &Blob, segments: &[Segment], ws: u32) -> (IProg, Vec<u8>) {
        let iprog = compile_from_segments("obj", segments, ws, blob).unwrap();
        let expected: Vec<u8> = segments
            .iter()
            .flat_map(|s| blob.read(s.offset, s.len as usize).unwrap())
            .collect();
        (iprog, expected)
    }

    /// Wire up N duplex channels between a sender and a shared receiver.
    async fn run_transfer(
        transfer_id: &str,
        channels: usize,
        receiver: Arc<SyncReceiver>,
        sender: BlueprintSender,
        iprog: &IProg,
        fingerprint: &Fingerprint,
    ) -> anyhow::Result<SendReport> {
        let mut client_halves: Vec<DuplexStream> = Vec::new();
        let mut handlers = Vec::new();
        for _ in 0..channels {
            let (client, server) = tokio::io::duplex(4 << 20);
            client_halves.push(client);
            let r = receiver.clone();
            handlers.push(tokio::spawn(async move { r.handle_channel(server).await }));
        }

        let report = sender
            .run(iprog, fingerprint, transfer_id, client_halves)
            .await?;
        for handler in handlers {
            handler.await??;
        }
        Ok(report)
    }

    #[tokio::test]
    async fn test_three_window_transfer() -> anyhow::Result<()> {
        let blob = shared_blob();
        let segments = [
            Segment {
                offset: 4096,
                len: 65536,
            },
            Segment {
                offset: 300_000,
                len: 65536,
            },
            Segment {
                offset: 900_000,
                len: 10,
            },
        ];
        let (iprog, expected) = segment_object(&blob, &segments, 65536);
        assert_eq!(iprog.total_windows(), 3);

        let receiver = Arc::new(SyncReceiver::new(
            fast_config(),
            blob.clone(),
            Arc::new(NoCache),
        ));
        let sender = BlueprintSender::new(fast_config(), BLOB_SIZE / 2);
        let report = run_transfer(
            "xfer-3w",
            1,
            receiver.clone(),
            sender,
            &iprog,
            blob.fingerprint(),
        )
        .await?;

        assert!(report.ok);
        assert_eq!(report.windows_sent, 3);

        let outcome = receiver.take_outcome("xfer-3w").await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.sha_match);
        assert_eq!(outcome.windows_received, 3);
        assert_eq!(outcome.data.len(), 65536 + 65536 + 10);
        assert_eq!(outcome.data, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_need_skips_cached_windows() -> anyhow::Result<()> {
        let blob = shared_blob();
        let segments = [
            Segment { offset: 0, len: 4096 },
            Segment {
                offset: 8192,
                len: 4096,
            },
            Segment {
                offset: 16384,
                len: 4096,
            },
        ];
        let (iprog, expected) = segment_object(&blob, &segments, 4096);

        // Receiver already holds windows 0 and 2; only window 1 should move.
        let cache = Arc::new(MemoryWindowCache::default());
        cache.insert(&expected[..4096]);
        cache.insert(&expected[8192..]);

        let receiver = Arc::new(SyncReceiver::new(fast_config(), blob.clone(), cache));
        let sender = BlueprintSender::new(fast_config(), 0);
        let report = run_transfer(
            "xfer-need",
            1,
            receiver.clone(),
            sender,
            &iprog,
            blob.fingerprint(),
        )
        .await?;

        assert!(report.ok);
        assert_eq!(report.windows_sent, 1);

        let outcome = receiver.take_outcome("xfer-need").await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.sha_match);
        assert_eq!(outcome.windows_received, 1);
        assert_eq!(outcome.data, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_seven_windows_over_three_channels() -> anyhow::Result<()> {
        let blob = shared_blob();
        let segments = [Segment {
            offset: 2048,
            len: 7 * 8192,
        }];
        let (iprog, expected) = segment_object(&blob, &segments, 8192);
        assert_eq!(iprog.total_windows(), 7);

        let receiver = Arc::new(SyncReceiver::new(
            fast_config(),
            blob.clone(),
            Arc::new(NoCache),
        ));
        let sender = BlueprintSender::new(fast_config(), 0);
        let report = run_transfer(
            "xfer-3ch",
            3,
            receiver.clone(),
            sender,
            &iprog,
            blob.fingerprint(),
        )
        .await?;

        assert!(report.ok);
        assert_eq!(report.windows_sent, 7);

        let outcome = receiver.take_outcome("xfer-3ch").await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.windows_received, 7);
        assert_eq!(outcome.data, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_more_channels_than_windows() -> anyhow::Result<()> {
        // Channels with an empty bucket still close their shard cleanly and
        // get acknowledged.
        let blob = shared_blob();
        let segments = [Segment { offset: 0, len: 4096 }];
        let (iprog, expected) = segment_object(&blob, &segments, 4096);

        let receiver = Arc::new(SyncReceiver::new(
            fast_config(),
            blob.clone(),
            Arc::new(NoCache),
        ));
        let sender = BlueprintSender::new(fast_config(), 0);
        let report = run_transfer(
            "xfer-idle",
            4,
            receiver.clone(),
            sender,
            &iprog,
            blob.fingerprint(),
        )
        .await?;

        assert!(report.ok);
        assert_eq!(report.windows_sent, 1);

        let outcome = receiver.take_outcome("xfer-idle").await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.data, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_relative_references_and_transforms() -> anyhow::Result<()> {
        let blob = shared_blob();
        let anchor = BLOB_SIZE / 2;

        // One window stitched from a relative back-reference and an
        // XOR-transformed absolute run.
        let refs = vec![
            Reference::relative(-1024, 512),
            Reference::absolute(128, 512).with_transform(bsync::container::Transform::Xor(0x1A)),
        ];
        let plaintext = bsync::container::resolve_all(&refs, &blob, anchor)?;
        let iprog = IProg {
            object_id: "rel".to_string(),
            size: plaintext.len() as u64,
            window_size: 1024,
            windows: vec![Window {
                index: 0,
                hash16: hash16(&plaintext),
                size: plaintext.len() as u32,
                refs,
                raw: None,
            }],
            sha256: Sha256::digest(&plaintext).into(),
        };

        let receiver = Arc::new(SyncReceiver::new(
            fast_config(),
            blob.clone(),
            Arc::new(NoCache),
        ));
        let sender = BlueprintSender::new(fast_config(), anchor);
        run_transfer(
            "xfer-rel",
            1,
            receiver.clone(),
            sender,
            &iprog,
            blob.fingerprint(),
        )
        .await?;

        let outcome = receiver.take_outcome("xfer-rel").await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.data, plaintext);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_window_detected() -> anyhow::Result<()> {
        let blob = shared_blob();
        let segments = [Segment { offset: 0, len: 4096 }];
        let (iprog, _) = segment_object(&blob, &segments, 4096);

        let config = SyncConfig {
            verify: VerifyPolicy::Fail,
            ..fast_config()
        };
        let receiver = Arc::new(SyncReceiver::new(config, blob.clone(), Arc::new(NoCache)));
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let r = receiver.clone();
        let handler = tokio::spawn(async move { r.handle_channel(server).await });

        // Scripted sender: the window's references point at the wrong bytes,
        // so the receiver's recomputed hash cannot match END.
        let window = &iprog.windows[0];
        protocol::write_msg(
            &mut client,
            &ControlMsg::Preface(protocol::Preface {
                transfer_id: "xfer-bad".to_string(),
                channels: 1,
                channel_id: 0,
                blob_fingerprint: blob.fingerprint().to_string(),
                object_sha256: iprog.sha_hex(),
                anchor: 0,
                psk: None,
            }),
        )
        .await?;
        protocol::write_msg(
            &mut client,
            &ControlMsg::Mfst(protocol::Manifest {
                algo: protocol::ALGO_SHA256_16.to_string(),
                ws: 4096,
                tw: 1,
                size: 4096,
                hashes: vec![hex::encode(window.hash16)],
            }),
        )
        .await?;
        match protocol::read_msg(&mut client).await? {
            ControlMsg::Need(need) => assert_eq!(need.needed, vec![0]),
            other => panic!("expected NEED, got {other:?}"),
        }

        let corrupt =
            bsync::container::Container::from_refs(vec![Reference::absolute(65536, 4096)]);
        protocol::write_msg(&mut client, &ControlMsg::Win(0)).await?;
        protocol::write_msg(&mut client, &ControlMsg::Payload(corrupt.encode())).await?;
        protocol::write_msg(
            &mut client,
            &ControlMsg::End {
                idx: 0,
                hash16: window.hash16,
            },
        )
        .await?;
        protocol::write_msg(
            &mut client,
            &ControlMsg::Done(protocol::Done {
                sha: iprog.sha_hex(),
                tw: 1,
                ws: 4096,
            }),
        )
        .await?;

        match protocol::read_msg(&mut client).await? {
            ControlMsg::Ack(ack) => {
                assert_eq!(ack.status, "done");
                assert!(!ack.ok);
            }
            other => panic!("expected ack, got {other:?}"),
        }
        handler.await??;

        let outcome = receiver.take_outcome("xfer-bad").await.unwrap();
        assert!(!outcome.ok);
        assert!(!outcome.sha_match);
        assert_eq!(outcome.mismatches.len(), 1);
        assert_eq!(outcome.mismatches[0].index, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_need_timeout_falls_back_to_all_windows() -> anyhow::Result<()> {
        let blob = shared_blob();
        let segments = [Segment { offset: 0, len: 2 * 4096 }];
        let (iprog, expected) = segment_object(&blob, &segments, 4096);

        let (client, mut server) = tokio::io::duplex(1 << 20);
        let sender = BlueprintSender::new(fast_config(), 0);

        // Scripted receiver that never sends NEED: the sender must ship every
        // window after its negotiation timeout.
        let blob2 = blob.clone();
        let expected2 = expected.clone();
        let peer = tokio::spawn(async move {
            let mut windows = 0u64;
            let mut assembled = Vec::new();
            let mut payload = Vec::new();
            loop {
                match protocol::read_msg(&mut server).await.unwrap() {
                    ControlMsg::Preface(_) | ControlMsg::Mfst(_) => {}
                    ControlMsg::Win(_) => payload.clear(),
                    ControlMsg::Payload(data) => payload.extend_from_slice(&data),
                    ControlMsg::End { .. } => {
                        let container = bsync::container::Container::decode(
                            bytes::Bytes::copy_from_slice(&payload),
                        )
                        .unwrap();
                        assembled.extend(container.materialize(&blob2, 0).unwrap());
                        windows += 1;
                    }
                    ControlMsg::Done(done) => {
                        assert_eq!(hex::encode(Sha256::digest(&assembled)), done.sha);
                        break;
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(windows, 2);
            assert_eq!(assembled, expected2);
            protocol::write_msg(
                &mut server,
                &ControlMsg::Ack(Ack {
                    status: "done".to_string(),
                    ok: true,
                    windows,
                    bytes: expected2.len() as u64,
                }),
            )
            .await
            .unwrap();
        });

        let report = sender
            .run(&iprog, blob.fingerprint(), "xfer-noneed", vec![client])
            .await?;
        peer.await?;

        assert!(report.ok);
        assert_eq!(report.windows_sent, 2);
        assert_eq!(report.receiver_windows, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_psk_gate_rejects_wrong_secret() -> anyhow::Result<()> {
        let blob = shared_blob();
        let segments = [Segment { offset: 0, len: 1024 }];
        let (iprog, _) = segment_object(&blob, &segments, 1024);

        let server_config = SyncConfig {
            psk: Some("right".to_string()),
            ..fast_config()
        };
        let client_config = SyncConfig {
            psk: Some("wrong".to_string()),
            ..fast_config()
        };

        let receiver = Arc::new(SyncReceiver::new(
            server_config,
            blob.clone(),
            Arc::new(NoCache),
        ));
        let (client, server) = tokio::io::duplex(1 << 20);
        let r = receiver.clone();
        let handler = tokio::spawn(async move { r.handle_channel(server).await });

        let sender = BlueprintSender::new(client_config, 0);
        let result = sender
            .run(&iprog, blob.fingerprint(), "xfer-psk", vec![client])
            .await;

        assert!(result.is_err());
        assert!(handler.await?.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_bootstrap_then_transfer() -> anyhow::Result<()> {
        // A peer with no generator support receives the blob over the wire,
        // then participates in a normal transfer against it.
        let source = shared_blob();
        let dir = tempfile::tempdir()?;

        let (mut a, mut b) = tokio::io::duplex(4 << 20);
        let config = fast_config();
        let recv_config = config.clone();
        let dir_path = dir.path().to_path_buf();
        let recv = tokio::spawn(async move {
            receive_blob(&mut b, &dir_path, &recv_config).await
        });
        send_blob(&source, 65536, &mut a, &config).await?;
        let bootstrapped = Arc::new(recv.await??);

        let segments = [Segment {
            offset: 123_456,
            len: 10_000,
        }];
        let (iprog, expected) = segment_object(&source, &segments, 4096);

        let receiver = Arc::new(SyncReceiver::new(
            fast_config(),
            bootstrapped,
            Arc::new(NoCache),
        ));
        let sender = BlueprintSender::new(fast_config(), 0);
        run_transfer(
            "xfer-boot",
            2,
            receiver.clone(),
            sender,
            &iprog,
            source.fingerprint(),
        )
        .await?;

        let outcome = receiver.take_outcome("xfer-boot").await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.data, expected);
        Ok(())
    }
}
