use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Restart recovery
// ══════════════════════════════════════════════════════════════════════════════

/// After a restart the queue reopens from disk: sequence numbers continue
/// where they stopped and already uploaded records are not repeated.
#[tokio::test]
async fn restart_continues_the_sequence() -> Result<()> {
    let root = temp_root("restart");
    let (state, relay) = spawn_relay().await?;

    {
        let store = team_store(&root)?;
        let mut queue = open_queue(&root, &store, vec![Box::new(Offline)])?;
        queue.watch_members()?;
        chat(&store, LEADER, 1_000, "before restart")?;
        queue.wake(Some(&relay)).await?;
    }
    let before = state.last_seq(&TEAM).context("nothing uploaded")?;

    let store = open_store(&root)?;
    chat(&store, LEADER, 2_000, "after restart")?;
    let mut queue = open_queue(&root, &store, vec![Box::new(Offline)])?;
    assert_eq!(i64::from(queue.fragments_mut().next_seq()), before + 1);
    assert!(!queue.watch_members()?);
    queue.wake(Some(&relay)).await?;

    assert!(state.last_seq(&TEAM) > Some(before));
    let events = state.events(&TEAM);
    assert_eq!(chats(&events), vec!["before restart", "after restart"]);
    let creates = events
        .iter()
        .filter(|e| matches!(e, TeamEvent::CreateTeam { .. }))
        .count();
    assert_eq!(creates, 1);
    Ok(())
}

/// Records written while the link is down all go out once it returns.
#[tokio::test]
async fn backlog_drains_after_outage() -> Result<()> {
    let root = temp_root("outage");
    let store = team_store(&root)?;
    let sink = UdpSocket::bind("127.0.0.1:0")?;
    sink.set_read_timeout(Some(std::time::Duration::from_millis(300)))?;

    {
        let mut queue = open_queue(&root, &store, vec![Box::new(Offline)])?;
        queue.watch_members()?;
        for i in 0..5 {
            chat(&store, LEADER, 1_000 * i, &format!("queued {i}"))?;
        }
        queue.wake(None).await?;
        assert!(queue.has_pending()?);
    }

    let gateway = LoopbackGateway::new(sink.local_addr()?, 200)?;
    let mut queue = open_queue(&root, &store, vec![Box::new(gateway)])?;
    queue.wake(None).await?;

    let mut datagrams = Vec::new();
    let mut buf = [0u8; 512];
    while let Ok((len, _)) = sink.recv_from(&mut buf) {
        datagrams.push(buf[..len].to_vec());
    }
    let events = decode_all(datagrams.iter().map(Vec::as_slice))?;
    let expected: Vec<String> = (0..5).map(|i| format!("queued {i}")).collect();
    assert_eq!(chats(&events), expected);
    Ok(())
}
