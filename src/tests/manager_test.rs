#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use futures::{SinkExt, StreamExt};
    use tokio::{io::AsyncWriteExt, net::TcpListener};
    use tokio_tungstenite::{client_async, connect_async, tungstenite::Message};

    use crate::{
        config::Config,
        envelope::GOING_AWAY,
        error::GustError,
        manager::Manager,
        session::Session,
        tests::support::{
            connect, connect_with_keys, next_event, quiet_config, recording_manager, wait_for,
            within, Event,
        },
        transport::{MemoryTransport, Outbound},
        types::{Keys, Value},
    };

    fn text(payload: &str) -> Outbound {
        Outbound::Text(payload.as_bytes().to_vec())
    }

    fn role(name: &'static str) -> Keys {
        HashMap::from([("role".to_string(), Arc::new(name) as Value)])
    }

    #[tokio::test]
    async fn test_with_config_sanitizes() {
        let manager = Manager::with_config(
            Config::default()
                .with_message_buffer_size(0)
                .with_hub_buffer_size(0),
        );
        assert_eq!(manager.config().message_buffer_size, 1);
        assert_eq!(manager.config().hub_buffer_size, 1);
        assert!(manager.is_empty());
        assert!(!manager.is_closed());
    }

    #[tokio::test]
    async fn test_sessions_and_ids() {
        let (manager, mut events) = recording_manager(quiet_config());
        let first = connect(&manager, &mut events).await;
        let second = connect(&manager, &mut events).await;

        assert!(first.id() < second.id());
        let ids: Vec<u64> = within(manager.sessions())
            .await
            .unwrap()
            .iter()
            .map(|session| session.id())
            .collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert_eq!(manager.len(), 2);
        assert!(!manager.is_empty());

        first.peer.disconnect();
        wait_for(&mut events, |event| *event == Event::Disconnect(first.id())).await;
        within(manager.sessions()).await.unwrap();
        assert_eq!(manager.len(), 1);
        assert!(within(first.intake).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut clients = vec![
            connect(&manager, &mut events).await,
            connect(&manager, &mut events).await,
            connect(&manager, &mut events).await,
        ];

        manager.broadcast("hello").await.unwrap();
        for client in clients.iter_mut() {
            assert_eq!(client.recv().await, text("hello"));
        }
    }

    #[tokio::test]
    async fn test_broadcast_others_skips_sender() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut a = connect(&manager, &mut events).await;
        let mut b = connect(&manager, &mut events).await;
        let mut c = connect(&manager, &mut events).await;

        manager.broadcast_others("from a", &a.session).await.unwrap();
        manager.broadcast("end").await.unwrap();

        assert_eq!(b.recv().await, text("from a"));
        assert_eq!(c.recv().await, text("from a"));
        assert_eq!(a.recv().await, text("end"));
        assert_eq!(b.recv().await, text("end"));
        assert_eq!(c.recv().await, text("end"));
    }

    #[tokio::test]
    async fn test_broadcast_filter_by_key() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut admin = connect_with_keys(&manager, &mut events, Some(role("admin"))).await;
        let mut guest = connect_with_keys(&manager, &mut events, Some(role("guest"))).await;
        let mut anonymous = connect(&manager, &mut events).await;

        manager
            .broadcast_filter("admins only", |session: &Session| {
                session
                    .get::<&str>("role")
                    .is_some_and(|role| *role == "admin")
            })
            .await
            .unwrap();
        manager.broadcast("end").await.unwrap();

        assert_eq!(admin.recv().await, text("admins only"));
        assert_eq!(admin.recv().await, text("end"));
        assert_eq!(guest.recv().await, text("end"));
        assert_eq!(anonymous.recv().await, text("end"));
    }

    #[tokio::test]
    async fn test_binary_broadcasts() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut a = connect(&manager, &mut events).await;
        let mut b = connect(&manager, &mut events).await;
        let a_id = a.id();

        manager.broadcast_binary(vec![1]).await.unwrap();
        manager
            .broadcast_binary_others(vec![2], &a.session)
            .await
            .unwrap();
        manager
            .broadcast_binary_filter(vec![3], move |session: &Session| session.id() == a_id)
            .await
            .unwrap();

        assert_eq!(a.recv().await, Outbound::Binary(vec![1]));
        assert_eq!(a.recv().await, Outbound::Binary(vec![3]));
        assert_eq!(b.recv().await, Outbound::Binary(vec![1]));
        assert_eq!(b.recv().await, Outbound::Binary(vec![2]));
        assert_eq!(
            wait_for(&mut events, |event| matches!(event, Event::SentBinary(id, _) if *id == a_id))
                .await,
            Event::SentBinary(a_id, vec![1])
        );
    }

    #[tokio::test]
    async fn test_broadcast_multiple() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut a = connect(&manager, &mut events).await;
        let mut b = connect(&manager, &mut events).await;
        let c = connect(&manager, &mut events).await;

        manager
            .broadcast_multiple("direct", &[Arc::clone(&a.session), Arc::clone(&b.session)])
            .await
            .unwrap();
        assert_eq!(a.recv().await, text("direct"));
        assert_eq!(b.recv().await, text("direct"));

        c.session.close().await.unwrap();
        wait_for(&mut events, |event| matches!(event, Event::Close(id, ..) if *id == c.id())).await;
        let result = manager
            .broadcast_multiple("late", &[Arc::clone(&c.session)])
            .await;
        assert!(matches!(result, Err(GustError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_broadcaster_handle_outlives_borrow() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut client = connect(&manager, &mut events).await;

        let broadcaster = manager.broadcaster();
        tokio::spawn(async move { broadcaster.broadcast("from a task").await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.recv().await, text("from a task"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_session() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut clients = vec![
            connect(&manager, &mut events).await,
            connect(&manager, &mut events).await,
        ];

        manager.shutdown().await.unwrap();
        assert!(manager.is_closed());
        assert_eq!(manager.len(), 0);

        for client in clients.iter_mut() {
            assert_eq!(
                client.recv().await,
                Outbound::Close {
                    code: 1000,
                    reason: String::new()
                }
            );
        }

        let mut closes = Vec::new();
        let mut disconnects = 0;
        while disconnects < clients.len() {
            match next_event(&mut events).await {
                Event::Close(id, code, _) => closes.push((id, code)),
                Event::Disconnect(_) => disconnects += 1,
                Event::Error(id, error) => panic!("unexpected error on {id}: {error}"),
                _ => {}
            }
        }
        closes.sort_unstable();
        assert_eq!(
            closes,
            vec![(clients[0].id(), 1000), (clients[1].id(), 1000)]
        );

        for client in clients {
            assert!(within(client.intake).await.unwrap().is_ok());
        }
        assert!(matches!(manager.shutdown().await, Err(GustError::HubClosed)));
        assert!(matches!(manager.broadcast("late").await, Err(GustError::HubClosed)));
        assert!(matches!(manager.sessions().await, Err(GustError::HubClosed)));
        assert!(manager.is_empty());

        let (transport, _peer) = MemoryTransport::pair();
        assert!(matches!(
            manager.handle_transport(transport, None).await,
            Err(GustError::HubClosed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_with_code_and_reason() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut a = connect(&manager, &mut events).await;
        let mut b = connect(&manager, &mut events).await;

        manager.shutdown_with(4000, "maintenance").await.unwrap();

        let expected = Outbound::Close {
            code: 4000,
            reason: "maintenance".to_string(),
        };
        assert_eq!(a.recv().await, expected);
        assert_eq!(b.recv().await, expected);
        for id in [a.id(), b.id()] {
            wait_for(&mut events, |event| {
                *event == Event::Close(id, 4000, "maintenance".to_string())
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_session_with_full_queue() {
        let (manager, mut events) = recording_manager(quiet_config().with_message_buffer_size(1));
        let mut client = connect(&manager, &mut events).await;
        let id = client.id();

        client.peer.pause();
        client.session.write("one").await.unwrap();
        // Let the write loop take "one" and block on the paused peer.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        client.session.write("two").await.unwrap();

        manager.shutdown_with(4000, "maintenance").await.unwrap();
        wait_for(&mut events, |event| event.is_error("OutputBufferFull")).await;

        client.peer.resume();
        wait_for(&mut events, |event| {
            *event == Event::Close(id, 4000, "maintenance".to_string())
        })
        .await;
        wait_for(&mut events, |event| *event == Event::Disconnect(id)).await;

        assert_eq!(client.recv().await, text("one"));
        assert_eq!(
            client.recv().await,
            Outbound::Close {
                code: 4000,
                reason: "maintenance".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_close_handler_error_goes_to_error_handler() {
        let (mut manager, mut events) = recording_manager(quiet_config());
        manager.on_close(|_session: Arc<Session>, _code: u16, _reason: String| async {
            Err::<(), GustError>(GustError::Io(std::io::Error::other("audit log unavailable")))
        });
        let client = connect(&manager, &mut events).await;

        client.session.close().await.unwrap();
        let event = wait_for(&mut events, |event| matches!(event, Event::Error(..))).await;
        assert!(event.is_error("Io("));
        wait_for(&mut events, |event| *event == Event::Disconnect(client.id())).await;
    }

    #[tokio::test]
    async fn test_handle_stream_performs_handshake() {
        let (manager, mut events) = recording_manager(quiet_config());
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let intake = manager.clone();
        let server = tokio::spawn(async move { intake.handle_stream(server_io, None).await });

        let (mut client, _response) = within(client_async("ws://localhost/", client_io))
            .await
            .unwrap();
        let Event::Connect(id) =
            wait_for(&mut events, |event| matches!(event, Event::Connect(_))).await
        else {
            unreachable!()
        };

        client.send(Message::text("hi there")).await.unwrap();
        assert_eq!(
            wait_for(&mut events, |event| matches!(event, Event::Message(..))).await,
            Event::Message(id, b"hi there".to_vec())
        );

        manager.broadcast("welcome").await.unwrap();
        let reply = within(client.next()).await.unwrap().unwrap();
        assert_eq!(reply, Message::text("welcome"));

        client.close(None).await.unwrap();
        // No status code in the peer's frame.
        wait_for(&mut events, |event| *event == Event::Close(id, 1005, String::new())).await;
        assert!(within(server).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_forever_for_silent_peer() {
        let config = quiet_config().with_write_wait(Duration::from_millis(100));
        let (manager, mut events) = recording_manager(config);
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let intake = manager.clone();
        let server = tokio::spawn(async move { intake.handle_stream(server_io, None).await });

        // The client completes the handshake and then never reads again.
        let (_client, _response) = within(client_async("ws://localhost/", client_io))
            .await
            .unwrap();
        let Event::Connect(id) =
            wait_for(&mut events, |event| matches!(event, Event::Connect(_))).await
        else {
            unreachable!()
        };
        let session = within(manager.sessions())
            .await
            .unwrap()
            .into_iter()
            .find(|session| session.id() == id)
            .unwrap();

        session.close().await.unwrap();
        wait_for(&mut events, |event| *event == Event::Close(id, 1000, String::new())).await;
        wait_for(&mut events, |event| *event == Event::Disconnect(id)).await;
        assert!(within(server).await.unwrap().is_ok());
        within(manager.sessions()).await.unwrap();
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_handle_stream_rejects_bad_handshake() {
        let manager = Manager::with_config(quiet_config());
        let (server_io, mut client_io) = tokio::io::duplex(1024);

        client_io
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        client_io.shutdown().await.unwrap();

        let result = within(manager.handle_stream(server_io, None)).await;
        assert!(matches!(result, Err(GustError::Handshake(_))));
        assert!(manager.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serve_over_tcp() {
        let mut manager = Manager::with_config(quiet_config());
        manager.on_message(|session: Arc<Session>, msg: Vec<u8>| async move {
            let _ = session.write(msg).await;
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = manager.clone();
        let serving = tokio::spawn(async move { server.serve(listener).await });

        let (mut client, _response) = within(connect_async(format!("ws://{addr}")))
            .await
            .unwrap();
        client.send(Message::text("echo")).await.unwrap();
        let reply = within(client.next()).await.unwrap().unwrap();
        assert_eq!(reply, Message::text("echo"));

        let sessions = within(manager.sessions()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].addr().is_some());

        manager
            .shutdown_with(GOING_AWAY, "server shutting down")
            .await
            .unwrap();
        match within(client.next()).await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), GOING_AWAY);
                assert_eq!(frame.reason.as_str(), "server shutting down");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(within(serving).await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_each_session_sees_broadcasts_in_order() {
        let (manager, mut events) = recording_manager(quiet_config());
        let mut clients = Vec::new();
        for _ in 0..16 {
            clients.push(connect(&manager, &mut events).await);
        }

        for n in 0..10 {
            manager.broadcast(format!("msg {n}")).await.unwrap();
        }
        for client in clients.iter_mut() {
            for n in 0..10 {
                assert_eq!(client.recv().await, text(&format!("msg {n}")));
            }
        }
    }
}
