use std::time::Duration;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Local gateway delivery
// ══════════════════════════════════════════════════════════════════════════════

fn receive_all(sink: &UdpSocket) -> Result<Vec<Vec<u8>>> {
    sink.set_read_timeout(Some(Duration::from_millis(300)))?;
    let mut out = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok((len, _)) = sink.recv_from(&mut buf) {
        out.push(buf[..len].to_vec());
    }
    Ok(out)
}

/// Fragments never exceed the negotiated MTU and carry consecutive
/// sequence numbers; a long chat survives being split across them.
#[tokio::test]
async fn long_chat_spans_fragments_within_mtu() -> Result<()> {
    let root = temp_root("gateway-mtu");
    let store = team_store(&root)?;
    let sink = UdpSocket::bind("127.0.0.1:0")?;
    let gateway = LoopbackGateway::new(sink.local_addr()?, 120)?;
    let mut queue = open_queue(&root, &store, vec![Box::new(gateway)])?;
    assert_eq!(queue.mtu(), 100);
    queue.watch_members()?;

    let long = "status report ".repeat(30);
    chat(&store, LEADER, 5_000, &long)?;
    queue.wake(None).await?;

    let datagrams = receive_all(&sink)?;
    assert!(datagrams.len() > 4);
    assert!(datagrams.iter().all(|d| d.len() <= 100));
    let seqs: Vec<u32> = datagrams
        .iter()
        .map(|d| u32::from_be_bytes([d[4], d[5], d[6], d[7]]))
        .collect();
    assert_eq!(seqs, (0..datagrams.len() as u32).collect::<Vec<_>>());

    let events = decode_all(datagrams.iter().map(Vec::as_slice))?;
    assert_eq!(chats(&events), vec![long]);
    Ok(())
}

/// Members joining later are enrolled before their first chat goes out.
#[tokio::test]
async fn late_member_enrolled_before_their_chat() -> Result<()> {
    let root = temp_root("gateway-late");
    let store = team_store(&root)?;
    let sink = UdpSocket::bind("127.0.0.1:0")?;
    let gateway = LoopbackGateway::new(sink.local_addr()?, 500)?;
    let mut queue = open_queue(&root, &store, vec![Box::new(gateway)])?;
    queue.watch_members()?;
    queue.wake(None).await?;
    let early = receive_all(&sink)?;

    let late = PeerId::from_bytes([0x09; 4]);
    add_member(&store, late, "carol")?;
    chat(&store, late, 3_000, "made it")?;
    assert!(queue.watch_members()?);
    queue.wake(None).await?;

    let all: Vec<Vec<u8>> = early.into_iter().chain(receive_all(&sink)?).collect();
    let events = decode_all(all.iter().map(Vec::as_slice))?;
    let enrolled = events
        .iter()
        .position(|e| matches!(e, TeamEvent::Enroll { name, .. } if name == "carol"))
        .context("carol never enrolled")?;
    let said = events
        .iter()
        .position(|e| matches!(e, TeamEvent::Chat { message, .. } if message == "made it"))
        .context("carol's chat missing")?;
    assert!(enrolled < said);
    Ok(())
}
