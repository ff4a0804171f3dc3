//! Ring maintenance under churn: convergence, notify rules, repair.

use std::sync::Arc;

use num_bigint::BigUint;

use super::*;
use crate::dht::StabilizeConfig;
use crate::dht::Stabilizer;
use crate::dht::SuccessorReader;

/// The node among `ids` responsible for `target`.
fn successor_of(ids: &[u32], target: Key) -> Key {
    let mut keys: Vec<Key> = ids.iter().copied().map(Key::from).collect();
    keys.sort_by_key(|k| (*k - target));
    keys[0]
}

#[tokio::test]
async fn test_two_node_ring_converges() {
    let net = SimNet::new();
    let members = ring_of(&net, &[4, 12]).await;
    settle(&members, 6).await;

    let (_, vnode0) = &members[0];
    let (node1, vnode1) = &members[1];
    assert_eq!(vnode0.successor().unwrap(), Some(Key::from(12u32)));
    assert_eq!(vnode0.predecessor().unwrap(), Some(Key::from(12u32)));
    assert_eq!(vnode1.successor().unwrap(), Some(Key::from(4u32)));
    assert_eq!(vnode1.predecessor().unwrap(), Some(Key::from(4u32)));

    let found = vnode1
        .find_successor(node1.as_ref(), Key::from(2u32))
        .await
        .unwrap();
    assert_eq!(found, Outcome::Ok(vnode0.peer_info()));
}

#[tokio::test]
async fn test_quiescent_ring_invariants() {
    let ids = [2u32, 6, 10, 14];
    let net = SimNet::new();
    let members = ring_of(&net, &ids).await;
    settle(&members, 10).await;
    fix_all_fingers(&members).await;

    for (_, vnode) in &members {
        let key = vnode.key();
        let succ = vnode.successor().unwrap().unwrap();
        let pred = vnode.predecessor().unwrap().unwrap();

        // every node sits between its predecessor and successor
        assert!(key.between(pred, succ) || pred == succ);
        assert_eq!(succ, successor_of(&ids, key + Key::from(1u32)));

        // finger slot 0, the successor field and the list head agree
        assert_eq!(vnode.lock_finger().unwrap().get(0), Some(succ));
        assert_eq!(vnode.successors().head().unwrap(), succ);

        // populated finger slots hold the node responsible for key + 2^i
        for i in 0..5usize {
            let target = key + Key::from(BigUint::from(2u16).pow(i as u32));
            let expect = successor_of(&ids, target);
            let slot = vnode.lock_finger().unwrap().get(i);
            if expect == key {
                assert_eq!(slot, None, "slot {i} of {key} must never point home");
            } else {
                assert_eq!(slot, Some(expect), "slot {i} of {key}");
            }
        }

        // every pointer resolves through the location table
        for entry in vnode.successors().list().unwrap() {
            assert!(vnode.table().find(entry).unwrap().is_some());
        }
        for entry in vnode.lock_finger().unwrap().list().iter().flatten() {
            assert!(vnode.table().find(*entry).unwrap().is_some());
        }
        assert!(vnode.table().find(pred).unwrap().is_some());
    }
}

#[tokio::test]
async fn test_notify_reassigns_predecessor() {
    let net = SimNet::new();
    let members = ring_of(&net, &[2, 10]).await;
    settle(&members, 6).await;
    let (_, vnode10) = &members[1];
    assert_eq!(vnode10.predecessor().unwrap(), Some(Key::from(2u32)));

    // a node appears between 2 and 10 and announces itself to 10
    let node6 = net.add_node(9006);
    let vnode6 = node6.register_vnode(Key::from(6u32)).unwrap();
    let joined = vnode6
        .join(node6.as_ref(), &members[0].1.peer_info())
        .await
        .unwrap();
    assert!(joined.is_ok());
    assert_eq!(vnode6.successor().unwrap(), Some(Key::from(10u32)));

    vnode6.stabilize(node6.as_ref()).await.unwrap();
    assert_eq!(vnode10.predecessor().unwrap(), Some(Key::from(6u32)));
}

#[tokio::test]
async fn test_address_change_refreshes_location_in_place() {
    let net = SimNet::new();
    let members = ring_of(&net, &[2, 10]).await;
    settle(&members, 6).await;
    let (node2, vnode2) = &members[0];
    assert!(vnode2.predecessor_is(Key::from(10u32)).unwrap());

    let before = vnode2.table().find(Key::from(10u32)).unwrap().unwrap();
    let entries = vnode2.table().len().unwrap();

    // 10 comes back on a different port and notifies its successor
    let moved = PeerInfo {
        key: Key::from(10u32),
        addr: NetAddress::new("sim", 9910),
    };
    let response = node2
        .handle_request(Request {
            recipient: Key::from(2u32),
            caller: moved.clone(),
            body: RequestBody::Notify,
        })
        .await;
    assert_eq!(response.status, crate::rpc::RemoteStatus::Ok);

    let after = vnode2.table().find(Key::from(10u32)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&before, &after), "binding must be refreshed, not replaced");
    assert_eq!(after.addr().unwrap(), moved.addr);
    assert_eq!(vnode2.table().len().unwrap(), entries);
    assert!(vnode2.predecessor_is(Key::from(10u32)).unwrap());
}

#[tokio::test]
async fn test_check_predecessor_clears_dead_peer() {
    let net = SimNet::new();
    let members = ring_of(&net, &[2, 10]).await;
    settle(&members, 6).await;
    let (node2, vnode2) = &members[0];

    net.kill(members[1].0.addr());
    vnode2.check_predecessor(node2.as_ref()).await.unwrap();
    assert_eq!(vnode2.predecessor().unwrap(), None);

    // the slot refills on the next honest notify
    let node6 = net.add_node(9006);
    let vnode6 = node6.register_vnode(Key::from(6u32)).unwrap();
    vnode6.set_successor(Key::from(2u32), members[0].0.addr()).unwrap();
    vnode6.stabilize(node6.as_ref()).await.unwrap();
    assert_eq!(vnode2.predecessor().unwrap(), Some(Key::from(6u32)));
}

#[tokio::test]
async fn test_join_through_dead_bootstrap_reports_transport() {
    let net = SimNet::new();
    let members = ring_of(&net, &[2]).await;
    net.kill(members[0].0.addr());

    let node6 = net.add_node(9006);
    let vnode6 = node6.register_vnode(Key::from(6u32)).unwrap();
    let joined = vnode6
        .join(node6.as_ref(), &members[0].1.peer_info())
        .await
        .unwrap();
    assert!(matches!(joined, Outcome::Transport(_)));
    assert_eq!(vnode6.successor().unwrap(), None, "nothing was installed");
}

#[tokio::test]
async fn test_stabilizer_runs_node_wide_and_drops_removed_vnodes() {
    let net = SimNet::new();
    let node = net.add_node(9001);
    let vnode_a = node.register_vnode(Key::from(4u32)).unwrap();
    let vnode_b = node.register_vnode(Key::from(12u32)).unwrap();
    vnode_a.create().unwrap();
    let joined = vnode_b.join(node.as_ref(), &vnode_a.peer_info()).await.unwrap();
    assert!(joined.is_ok());

    let stabilizer = Stabilizer::with_config(node.clone(), StabilizeConfig::default());
    for _ in 0..4 {
        stabilizer.stabilize().await.unwrap();
    }

    // two co-hosted virtual nodes form a ring without any wire traffic
    assert_eq!(vnode_a.successor().unwrap(), Some(Key::from(12u32)));
    assert_eq!(vnode_b.successor().unwrap(), Some(Key::from(4u32)));
    assert_eq!(net.calls("notify"), 0);

    // removal takes the vnode out of the maintenance set in the same step
    node.remove_vnode(Key::from(12u32)).unwrap();
    assert_eq!(node.vnodes().unwrap().len(), 1);
    stabilizer.stabilize().await.unwrap();
}
