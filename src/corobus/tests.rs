use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;

use super::{Bus, BusError};

#[test]
fn open_reuses_lowest_free_slot() {
    let bus = Bus::new();
    assert_eq!(bus.open(1), 0);
    assert_eq!(bus.open(1), 1);
    assert_eq!(bus.open(1), 2);
    bus.close(1);
    assert_eq!(bus.open(4), 1);
    assert_eq!(bus.open(4), 3);
}

#[test]
fn try_ops_on_unknown_handle() {
    let bus = Bus::new();
    assert_eq!(bus.try_send(7, 1), Err(BusError::NoChannel));
    assert_eq!(bus.try_recv(7), Err(BusError::NoChannel));
    let handle = bus.open(1);
    bus.close(handle);
    assert_eq!(bus.try_send(handle, 1), Err(BusError::NoChannel));
}

#[test]
fn try_send_respects_size_limit() {
    let bus = Bus::new();
    let handle = bus.open(2);
    assert_eq!(bus.try_send(handle, 10), Ok(()));
    assert_eq!(bus.try_send(handle, 11), Ok(()));
    assert_eq!(bus.try_send(handle, 12), Err(BusError::WouldBlock));
    assert_eq!(bus.try_recv(handle), Ok(10));
    assert_eq!(bus.try_send(handle, 12), Ok(()));
    assert_eq!(bus.try_recv(handle), Ok(11));
    assert_eq!(bus.try_recv(handle), Ok(12));
    assert_eq!(bus.try_recv(handle), Err(BusError::WouldBlock));
}

#[test]
fn blocking_send_recv_keep_fifo_order() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let bus = Rc::new(Bus::new());
    let handle = bus.open(1);
    let received = Rc::new(RefCell::new(Vec::new()));

    {
        let bus = Rc::clone(&bus);
        spawner
            .spawn_local(async move {
                for value in [1, 2, 3] {
                    bus.send(handle, value).await.unwrap();
                }
            })
            .unwrap();
    }
    {
        let bus = Rc::clone(&bus);
        let received = Rc::clone(&received);
        spawner
            .spawn_local(async move {
                for _ in 0..3 {
                    received.borrow_mut().push(bus.recv(handle).await.unwrap());
                }
            })
            .unwrap();
    }

    pool.run();
    assert_eq!(*received.borrow(), vec![1, 2, 3]);
}

#[test]
fn send_suspends_until_recv_makes_space() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let bus = Rc::new(Bus::new());
    let handle = bus.open(1);
    bus.try_send(handle, 1).unwrap();

    let done = Rc::new(RefCell::new(None));
    {
        let bus = Rc::clone(&bus);
        let done = Rc::clone(&done);
        spawner
            .spawn_local(async move {
                *done.borrow_mut() = Some(bus.send(handle, 2).await);
            })
            .unwrap();
    }

    pool.run_until_stalled();
    assert!(done.borrow().is_none(), "send on a full channel must suspend");

    assert_eq!(bus.try_recv(handle), Ok(1));
    pool.run_until_stalled();
    assert_eq!(*done.borrow(), Some(Ok(())));
    assert_eq!(bus.try_recv(handle), Ok(2));
}

#[test]
fn close_wakes_every_waiter_with_no_channel() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let bus = Rc::new(Bus::new());
    let full = bus.open(1);
    let empty = bus.open(1);
    bus.try_send(full, 1).unwrap();

    let send_res = Rc::new(RefCell::new(None));
    let recv_res = Rc::new(RefCell::new(None));
    {
        let bus = Rc::clone(&bus);
        let send_res = Rc::clone(&send_res);
        spawner
            .spawn_local(async move {
                *send_res.borrow_mut() = Some(bus.send(full, 2).await);
            })
            .unwrap();
    }
    {
        let bus = Rc::clone(&bus);
        let recv_res = Rc::clone(&recv_res);
        spawner
            .spawn_local(async move {
                *recv_res.borrow_mut() = Some(bus.recv(empty).await);
            })
            .unwrap();
    }

    pool.run_until_stalled();
    assert!(send_res.borrow().is_none());
    assert!(recv_res.borrow().is_none());

    bus.close(full);
    bus.close(empty);
    pool.run();
    assert_eq!(*send_res.borrow(), Some(Err(BusError::NoChannel)));
    assert_eq!(*recv_res.borrow(), Some(Err(BusError::NoChannel)));
}

#[test]
fn waiter_survives_slot_reuse_after_close() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let bus = Rc::new(Bus::new());
    let handle = bus.open(1);
    bus.try_send(handle, 1).unwrap();

    let res = Rc::new(RefCell::new(None));
    {
        let bus = Rc::clone(&bus);
        let res = Rc::clone(&res);
        spawner
            .spawn_local(async move {
                *res.borrow_mut() = Some(bus.send(handle, 2).await);
            })
            .unwrap();
    }
    pool.run_until_stalled();

    bus.close(handle);
    // The slot index is immediately reused by a fresh channel.
    assert_eq!(bus.open(8), handle);
    pool.run();
    assert_eq!(*res.borrow(), Some(Err(BusError::NoChannel)));
    // The new channel never saw the suspended send.
    assert_eq!(bus.try_recv(handle), Err(BusError::WouldBlock));
}

#[test]
fn send_v_transfers_partially() {
    let bus = Bus::new();
    let handle = bus.open(4);
    assert_eq!(bus.try_send_v(handle, &[1, 2, 3, 4, 5, 6]), Ok(4));
    assert_eq!(
        bus.try_send_v(handle, &[7]),
        Err(BusError::WouldBlock),
        "completely full channel must refuse"
    );
    let mut buf = [0; 8];
    assert_eq!(bus.try_recv_v(handle, &mut buf), Ok(4));
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    assert_eq!(bus.try_recv_v(handle, &mut buf), Err(BusError::WouldBlock));
}

#[test]
fn recv_v_caps_at_buffer_capacity() {
    let bus = Bus::new();
    let handle = bus.open(8);
    assert_eq!(bus.try_send_v(handle, &[1, 2, 3, 4, 5]), Ok(5));
    let mut buf = [0; 2];
    assert_eq!(bus.try_recv_v(handle, &mut buf), Ok(2));
    assert_eq!(buf, [1, 2]);
    assert_eq!(bus.try_recv_v(handle, &mut buf), Ok(2));
    assert_eq!(buf, [3, 4]);
    assert_eq!(bus.try_recv_v(handle, &mut buf), Ok(1));
    assert_eq!(buf[0], 5);
}

#[test]
fn send_v_blocks_only_when_completely_full() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let bus = Rc::new(Bus::new());
    let handle = bus.open(2);
    bus.try_send(handle, 1).unwrap();
    bus.try_send(handle, 2).unwrap();

    let res = Rc::new(RefCell::new(None));
    {
        let bus = Rc::clone(&bus);
        let res = Rc::clone(&res);
        spawner
            .spawn_local(async move {
                *res.borrow_mut() = Some(bus.send_v(handle, &[3, 4, 5]).await);
            })
            .unwrap();
    }
    pool.run_until_stalled();
    assert!(res.borrow().is_none());

    // One slot frees up; the suspended send_v completes partially.
    assert_eq!(bus.try_recv(handle), Ok(1));
    pool.run_until_stalled();
    assert_eq!(*res.borrow(), Some(Ok(1)));
}

#[test]
fn broadcast_is_all_or_nothing() {
    let bus = Bus::new();
    assert_eq!(bus.try_broadcast(1), Err(BusError::NoChannel));

    let a = bus.open(1);
    let b = bus.open(2);
    assert_eq!(bus.try_broadcast(7), Ok(()));
    // Channel `a` is now full, so nothing may be enqueued anywhere.
    assert_eq!(bus.try_broadcast(8), Err(BusError::WouldBlock));
    assert_eq!(bus.try_recv(b), Ok(7));
    assert_eq!(bus.try_recv(b), Err(BusError::WouldBlock));
    assert_eq!(bus.try_recv(a), Ok(7));
}

#[test]
fn blocking_broadcast_waits_for_every_full_channel() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let bus = Rc::new(Bus::new());
    let a = bus.open(1);
    let b = bus.open(1);
    bus.try_broadcast(7).unwrap();

    let res = Rc::new(RefCell::new(None));
    {
        let bus = Rc::clone(&bus);
        let res = Rc::clone(&res);
        spawner
            .spawn_local(async move {
                *res.borrow_mut() = Some(bus.broadcast(8).await);
            })
            .unwrap();
    }
    pool.run_until_stalled();
    assert!(res.borrow().is_none());

    assert_eq!(bus.try_recv(a), Ok(7));
    pool.run_until_stalled();
    assert!(res.borrow().is_none(), "still blocked on the second channel");

    assert_eq!(bus.try_recv(b), Ok(7));
    pool.run_until_stalled();
    assert_eq!(*res.borrow(), Some(Ok(())));
    assert_eq!(bus.try_recv(a), Ok(8));
    assert_eq!(bus.try_recv(b), Ok(8));
}

#[test]
fn broadcast_with_last_channel_closed_reports_no_channel() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let bus = Rc::new(Bus::new());
    let only = bus.open(1);
    bus.try_send(only, 1).unwrap();

    let res = Rc::new(RefCell::new(None));
    {
        let bus = Rc::clone(&bus);
        let res = Rc::clone(&res);
        spawner
            .spawn_local(async move {
                *res.borrow_mut() = Some(bus.broadcast(2).await);
            })
            .unwrap();
    }
    pool.run_until_stalled();
    bus.close(only);
    pool.run();
    assert_eq!(*res.borrow(), Some(Err(BusError::NoChannel)));
}
