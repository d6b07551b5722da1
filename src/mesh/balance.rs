use log::warn;

use crate::error::{Result, RillError};

/// A contiguous assignment of blocks to ranks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    /// Owning rank per gid.
    pub rank: Vec<usize>,
    /// First gid owned by each rank.
    pub start: Vec<usize>,
    /// Number of gids owned by each rank.
    pub count: Vec<usize>,
}

impl Balance {
    pub fn local_range(&self, rank: usize) -> std::ops::Range<usize> {
        self.start[rank]..self.start[rank] + self.count[rank]
    }
}

/// Distributes blocks over ranks so that each rank owns a contiguous gid
/// range with near-equal cost.
///
/// The walk runs from the highest gid down, filling the last rank first and
/// re-deriving the target from the remaining cost after each rank closes.
/// Rank 0 ends up with the slightly lighter tail; it typically also carries
/// the I/O work.
pub fn load_balance(
    cost: &[f64],
    nranks: usize,
    adaptive: bool,
    my_rank: usize,
) -> Result<Balance> {
    let nb = cost.len();

    let mut total: f64 = cost.iter().sum();
    let mincost = cost.iter().cloned().fold(f64::INFINITY, f64::min);
    let maxcost = cost.iter().cloned().fold(0.0f64, f64::max);

    let mut rank = vec![0usize; nb];
    let mut j = nranks - 1;
    let mut target = total / nranks as f64;
    let mut mine = 0.0;

    for i in (0..nb).rev() {
        if target == 0.0 {
            return Err(RillError::LoadBalance(
                "there is at least one process with no block; \
                 decrease the number of processes or use smaller blocks"
                    .to_string(),
            ));
        }
        mine += cost[i];
        rank[i] = j;
        if mine >= target && j > 0 {
            j -= 1;
            total -= mine;
            mine = 0.0;
            target = total / (j + 1) as f64;
        }
    }

    let mut start = vec![0usize; nranks];
    let mut count = vec![0usize; nranks];
    let mut j = 0;
    for i in 1..nb {
        if rank[i] != rank[i - 1] {
            count[j] = i - start[j];
            j += 1;
            start[j] = i;
        }
    }
    count[j] = nb - start[j];

    if j + 1 < nranks {
        return Err(RillError::LoadBalance(format!(
            "only {} of {} ranks received blocks",
            j + 1,
            nranks
        )));
    }

    if nb % nranks != 0 && !adaptive && maxcost == mincost && my_rank == 0 {
        warn!(
            "the number of blocks ({nb}) cannot be divided evenly over {nranks} ranks; \
             this will cause a permanent load imbalance"
        );
    }

    Ok(Balance { rank, start, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split() {
        let balance = load_balance(&[1.0; 8], 4, false, 0).unwrap();
        assert_eq!(balance.rank, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(balance.start, vec![0, 2, 4, 6]);
        assert_eq!(balance.count, vec![2, 2, 2, 2]);
    }

    #[test]
    fn one_block_per_rank() {
        let balance = load_balance(&[1.0; 4], 4, false, 0).unwrap();
        assert_eq!(balance.rank, vec![0, 1, 2, 3]);
        assert_eq!(balance.count, vec![1, 1, 1, 1]);
    }

    #[test]
    fn block_zero_lands_on_rank_zero() {
        let balance = load_balance(&[1.0; 7], 2, false, 0).unwrap();
        assert_eq!(balance.rank[0], 0);
        // Rank 0 takes the lighter share.
        assert!(balance.count[0] <= balance.count[1]);
    }

    #[test]
    fn contiguity_with_uneven_costs() {
        let cost = vec![4.0, 1.0, 1.0, 1.0, 1.0, 4.0, 1.0, 1.0];
        let balance = load_balance(&cost, 3, true, 0).unwrap();

        for rank in 0..3 {
            assert!(balance.count[rank] >= 1);
            for gid in balance.local_range(rank) {
                assert_eq!(balance.rank[gid], rank);
            }
        }
        // Ranks cover all gids in order.
        assert_eq!(balance.start[0], 0);
        for rank in 1..3 {
            assert_eq!(
                balance.start[rank],
                balance.start[rank - 1] + balance.count[rank - 1]
            );
        }
    }

    #[test]
    fn too_many_ranks_is_fatal() {
        assert!(load_balance(&[1.0; 2], 3, false, 0).is_err());
    }
}
