//! Builds exchange pairs from two lists of isolated pages.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::env::PagePool;
use crate::exchange::options::OrderMismatchPolicy;
use crate::primitives::page::{Page, PagePair};
use crate::types::ExchangeError;

/// Pairs built from two isolated lists.
#[derive(Default)]
pub struct Pairing {
    /// Pairs with matching frame counts, in list order.
    pub pairs: Vec<PagePair>,
    /// Pages put back because their frame counts could not be paired.
    pub rejected: Vec<(Arc<Page>, ExchangeError)>,
}

/// Pops pages off the fronts of `from` and `to` and pairs them while both
/// lists have pages.
///
/// A head pair with different frame counts is set aside and handled by
/// `policy`: [`OrderMismatchPolicy::Requeue`] returns the pages to the fronts
/// of their lists once pairing ends, [`OrderMismatchPolicy::Reject`] puts
/// them back on `pool`. Pages left over on the longer list stay where they
/// are.
pub fn pair_isolated(
    from: &mut VecDeque<Arc<Page>>,
    to: &mut VecDeque<Arc<Page>>,
    policy: OrderMismatchPolicy,
    pool: &dyn PagePool,
) -> Pairing {
    let mut pairing = Pairing::default();
    let mut odd_from = Vec::new();
    let mut odd_to = Vec::new();

    while !from.is_empty() && !to.is_empty() {
        let (Some(f), Some(t)) = (from.pop_front(), to.pop_front()) else {
            break;
        };
        if f.nr_frames() == t.nr_frames() {
            pairing.pairs.push(PagePair::new(f, t));
            continue;
        }
        debug!(from = %f.frame(), to = %t.frame(), "frame counts differ");
        match policy {
            OrderMismatchPolicy::Requeue => {
                odd_from.push(f);
                odd_to.push(t);
            }
            OrderMismatchPolicy::Reject => {
                let err = ExchangeError::OrderMismatch {
                    from: f.nr_frames(),
                    to: t.nr_frames(),
                };
                pool.putback(&f);
                pool.putback(&t);
                pairing.rejected.push((f, err.clone()));
                pairing.rejected.push((t, err));
            }
        }
    }

    for page in odd_from.into_iter().rev() {
        from.push_front(page);
    }
    for page in odd_to.into_iter().rev() {
        to.push_front(page);
    }
    pairing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::page::PageKind;
    use crate::types::FrameId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Returned(Mutex<Vec<FrameId>>);

    impl PagePool for Returned {
        fn putback(&self, page: &Arc<Page>) {
            self.0.lock().push(page.frame());
        }
    }

    fn base(frame: u64) -> Arc<Page> {
        Page::builder(FrameId(frame)).frame_size(64).build()
    }

    fn huge(frame: u64) -> Arc<Page> {
        Page::builder(FrameId(frame))
            .frame_size(64)
            .huge(PageKind::TransHuge, 4)
            .build()
    }

    #[test]
    fn matching_pages_pair_in_order() {
        let mut from: VecDeque<_> = [base(1), base(2), base(3)].into();
        let mut to: VecDeque<_> = [base(11), base(12)].into();
        let pairing = pair_isolated(&mut from, &mut to, OrderMismatchPolicy::Requeue, &Returned::default());
        let frames: Vec<_> = pairing
            .pairs
            .iter()
            .map(|p| (p.from.frame().0, p.to.frame().0))
            .collect();
        assert_eq!(frames, vec![(1, 11), (2, 12)]);
        assert_eq!(from.len(), 1);
        assert!(to.is_empty());
    }

    #[test]
    fn mismatch_is_requeued_at_the_front() {
        let mut from: VecDeque<_> = [huge(1), base(2)].into();
        let mut to: VecDeque<_> = [base(11), base(12)].into();
        let pool = Returned::default();
        let pairing = pair_isolated(&mut from, &mut to, OrderMismatchPolicy::Requeue, &pool);
        assert_eq!(pairing.pairs.len(), 1);
        assert_eq!(pairing.pairs[0].from.frame(), FrameId(2));
        assert_eq!(pairing.pairs[0].to.frame(), FrameId(12));
        assert_eq!(from.front().map(|p| p.frame()), Some(FrameId(1)));
        assert_eq!(to.front().map(|p| p.frame()), Some(FrameId(11)));
        assert!(pool.0.lock().is_empty());
    }

    #[test]
    fn mismatch_is_rejected_and_put_back() {
        let mut from: VecDeque<_> = [huge(1)].into();
        let mut to: VecDeque<_> = [base(11)].into();
        let pool = Returned::default();
        let pairing = pair_isolated(&mut from, &mut to, OrderMismatchPolicy::Reject, &pool);
        assert!(pairing.pairs.is_empty());
        assert_eq!(pairing.rejected.len(), 2);
        assert_eq!(
            pairing.rejected[0].1,
            ExchangeError::OrderMismatch { from: 4, to: 1 }
        );
        assert_eq!(*pool.0.lock(), vec![FrameId(1), FrameId(11)]);
        assert!(from.is_empty() && to.is_empty());
    }
}
