use crate::*;

use succinct_core::TeamEvent;

// ══════════════════════════════════════════════════════════════════════════════
//  Relay path
// ══════════════════════════════════════════════════════════════════════════════

/// A relay that has never heard of the team answers 404 to the ack query;
/// the leader uploads from seq 0 and the relay reassembles the whole team
/// history, team state and enrollments ahead of chat.
#[tokio::test]
async fn relay_receives_team_history_in_priority_order() -> Result<()> {
    let root = temp_root("relay-history");
    let store = team_store(&root)?;
    let member = PeerId::from_bytes([0x02; 4]);
    add_member(&store, member, "bob")?;

    let (state, relay) = spawn_relay().await?;
    assert_eq!(relay.get_ack(&TEAM).await?, None);

    let mut queue = open_queue(&root, &store, vec![Box::new(Offline)])?;
    queue.watch_members()?;
    chat(&store, member, 1_000, "on site")?;
    chat(&store, LEADER, 2_000, "copy")?;

    queue.wake(Some(&relay)).await?;

    let events = state.events(&TEAM);
    assert!(matches!(events.first(), Some(TeamEvent::CreateTeam { epoch: EPOCH, .. })));
    let first_chat = events
        .iter()
        .position(|e| matches!(e, TeamEvent::Chat { .. }))
        .context("no chat reached the relay")?;
    let enrolls: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, TeamEvent::Enroll { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(enrolls.len(), 2);
    assert!(enrolls.iter().all(|&i| i < first_chat));

    let mut texts = chats(&events);
    texts.sort();
    assert_eq!(texts, vec!["copy".to_string(), "on site".to_string()]);

    let last = relay.get_ack(&TEAM).await?.context("relay holds nothing")?;
    assert_eq!(last, i64::from(queue.fragments_mut().next_seq()) - 1);
    assert!(!queue.has_pending()?);
    Ok(())
}

/// Nothing is uploaded twice across passes.
#[tokio::test]
async fn later_passes_upload_only_new_fragments() -> Result<()> {
    let root = temp_root("relay-incremental");
    let store = team_store(&root)?;
    let (state, relay) = spawn_relay().await?;
    let mut queue = open_queue(&root, &store, vec![Box::new(Offline)])?;
    queue.watch_members()?;

    chat(&store, LEADER, 1_000, "one")?;
    queue.wake(Some(&relay)).await?;
    let after_first = state.last_seq(&TEAM).context("nothing uploaded")?;

    chat(&store, LEADER, 2_000, "two")?;
    queue.wake(Some(&relay)).await?;
    assert!(state.last_seq(&TEAM) > Some(after_first));
    assert_eq!(chats(&state.events(&TEAM)), vec!["one", "two"]);
    Ok(())
}

/// A replacement relay with no state gets the whole log replayed from
/// seq 0 once the leader has something new to say.
#[tokio::test]
async fn empty_replacement_relay_gets_full_replay() -> Result<()> {
    let root = temp_root("relay-replay");
    let store = team_store(&root)?;
    let mut queue = open_queue(&root, &store, vec![Box::new(Offline)])?;
    queue.watch_members()?;

    let (_, first) = spawn_relay().await?;
    chat(&store, LEADER, 1_000, "before")?;
    queue.wake(Some(&first)).await?;

    let (state, second) = spawn_relay().await?;
    chat(&store, LEADER, 2_000, "after")?;
    // the first pass only learns that the relay holds nothing
    queue.wake(Some(&second)).await?;
    assert_eq!(state.last_seq(&TEAM), None);
    queue.wake(Some(&second)).await?;

    assert!(matches!(
        state.events(&TEAM).first(),
        Some(TeamEvent::CreateTeam { .. })
    ));
    assert_eq!(chats(&state.events(&TEAM)), vec!["before", "after"]);
    Ok(())
}

/// An unreachable relay is not fatal; local transports still run.
#[tokio::test]
async fn unreachable_relay_leaves_local_delivery_running() -> Result<()> {
    let root = temp_root("relay-down");
    let store = team_store(&root)?;
    let sink = std::net::UdpSocket::bind("127.0.0.1:0")?;
    sink.set_read_timeout(Some(std::time::Duration::from_secs(2)))?;
    let gateway = LoopbackGateway::new(sink.local_addr()?, 300)?;
    let mut queue = open_queue(&root, &store, vec![Box::new(gateway)])?;

    // nothing listens on port 9 of loopback
    let relay = RelayClient::new("http://127.0.0.1:9");
    queue.wake(Some(&relay)).await?;

    let mut buf = [0u8; 512];
    let (len, _) = sink.recv_from(&mut buf)?;
    let events = decode_all([&buf[..len]])?;
    assert!(matches!(events.first(), Some(TeamEvent::CreateTeam { .. })));
    Ok(())
}
