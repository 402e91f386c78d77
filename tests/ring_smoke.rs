//! Real-ring smoke tests. Skipped on kernels without io_uring.

use tpcio::uring::{OpKind, Uring, UserData};

#[test]
fn test_nop_submit_and_reap() {
    if !Uring::is_supported() {
        eprintln!("skipping: io_uring not available");
        return;
    }

    let mut uring = Uring::setup(8, true).unwrap();

    let ud = UserData::encode(OpKind::Nop, 7, 3);
    assert!(uring.sq.offer_nop(ud.raw()));
    assert_eq!(uring.sq.submit_and_wait().unwrap(), 1);

    let mut seen = Vec::new();
    uring.cq.process(|user_data, res, _flags| seen.push((user_data, res)));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, ud.raw());
    assert_eq!(seen[0].1, 0);

    uring.close();
}

#[test]
fn test_capacity_exhaustion_and_reuse() {
    if !Uring::is_supported() {
        eprintln!("skipping: io_uring not available");
        return;
    }

    let mut uring = Uring::setup(4, false).unwrap();

    for i in 0..4 {
        assert!(uring.sq.offer_nop(i), "reservation {i} should fit");
    }
    // Nothing has been published, so the kernel cannot have made room.
    assert!(!uring.sq.offer_nop(99));

    assert_eq!(uring.sq.submit_and_wait().unwrap(), 4);
    let mut completions = 0;
    while completions < 4 {
        completions += uring.cq.process(|_, res, _| assert_eq!(res, 0));
    }

    // The drained ring accepts a full batch again.
    for i in 0..4 {
        assert!(uring.sq.offer_nop(100 + i));
    }

    uring.close();
}
