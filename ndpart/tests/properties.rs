/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::BTreeSet;

use ndpart::Decomposition;
use ndpart::IndexExpr;
use ndpart::Range;
use ndpart::build_transfer_plan;
use ndpart::common_decomposition;
use proptest::prelude::*;

/// A randomly balanced 1-d decomposition together with its extent.
fn balanced_1d() -> impl Strategy<Value = Decomposition> {
    (1usize..200, 1usize..12).prop_map(|(extent, ranks)| {
        Decomposition::balanced(vec![extent], vec![0], ranks)
            .expect("balanced decomposition over a nonempty axis")
    })
}

fn balanced_2d() -> impl Strategy<Value = Decomposition> {
    (1usize..40, 1usize..40, 1usize..12).prop_map(|(rows, cols, ranks)| {
        Decomposition::balanced(vec![rows, cols], vec![0, 1], ranks)
            .expect("balanced decomposition over a nonempty grid")
    })
}

/// The global boundary set of one distributed axis: every partition
/// begin, excluding 0.
fn inner_boundaries(d: &Decomposition, pos: usize) -> BTreeSet<usize> {
    d.offsets()[pos].iter().copied().filter(|&o| o != 0).collect()
}

proptest! {
    // Partitions tile each distributed axis exactly: contiguous,
    // non-overlapping, full coverage.
    #[test]
    fn partitions_cover_each_axis(d in balanced_2d()) {
        for (pos, &axis) in d.distaxes().iter().enumerate() {
            let mut cursor = 0;
            for part in 0..d.offsets()[pos].len() {
                let (begin, end) = d.axis_bounds(pos, part);
                prop_assert_eq!(begin, cursor);
                prop_assert!(end > begin);
                cursor = end;
            }
            prop_assert_eq!(cursor, d.shape()[axis]);
        }
    }

    // Partition block volumes sum to the array volume, and every
    // global index resolves to exactly the rank whose block holds it.
    #[test]
    fn partition_volumes_sum_to_total(d in balanced_2d()) {
        let volume: usize = d.shape().iter().product();
        let sum: usize = d
            .partition_shapes()
            .iter()
            .map(|s| s.iter().product::<usize>())
            .sum();
        prop_assert_eq!(sum, volume);
    }

    #[test]
    fn owner_lookup_matches_partition_bounds(
        d in balanced_2d(),
        row_frac in 0.0f64..1.0,
        col_frac in 0.0f64..1.0,
    ) {
        let row = (row_frac * d.shape()[0] as f64) as usize;
        let col = (col_frac * d.shape()[1] as f64) as usize;
        let (rank, local) = d.owner_of(&[row, col]).unwrap();

        let pos = d.ranks().iter().position(|&r| r == rank).unwrap();
        let origin = &d.partition_origins()[pos];
        let shape = &d.partition_shapes()[pos];
        for axis in 0..2 {
            let global = [row, col][axis];
            prop_assert!(global >= origin[axis]);
            prop_assert!(global < origin[axis] + shape[axis]);
            prop_assert_eq!(local[axis], global - origin[axis]);
        }
    }

    // A strided slice of a decomposition covers exactly the selected
    // elements: per-rank window lengths sum to the sliced extent and
    // the new offsets agree with the window lengths cumulatively.
    #[test]
    fn sliced_windows_cover_selection(
        d in balanced_1d(),
        begin_frac in 0.0f64..1.0,
        step in 1usize..5,
    ) {
        let extent = d.shape()[0];
        let begin = ((begin_frac * extent as f64) as usize).min(extent - 1);
        let sliced = d.slice(&[IndexExpr::Span(Range(begin, None, step))]).unwrap();

        let selected = (extent - begin).div_ceil(step);
        prop_assert_eq!(sliced.decomposition.shape(), &[selected]);

        let total: usize = sliced.windows.iter().map(|w| w.len()).sum();
        prop_assert_eq!(total, selected);

        let mut cumulative = 0;
        for (part, window) in sliced.windows.iter().enumerate() {
            prop_assert_eq!(sliced.decomposition.offsets()[0][part], cumulative);
            cumulative += window.len();
        }
    }

    // Merged segment boundaries are exactly the union of both sides'
    // boundaries.
    #[test]
    fn merge_offsets_are_boundary_union(a in balanced_1d(), ranks_b in 1usize..12) {
        let b = Decomposition::balanced(a.shape().to_vec(), vec![0], ranks_b).unwrap();
        let merges = common_decomposition(&a, &b).unwrap();
        let mut expected: BTreeSet<usize> = inner_boundaries(&a, 0);
        expected.extend(inner_boundaries(&b, 0));
        expected.insert(0);
        let got: BTreeSet<usize> = merges[0].offsets.iter().copied().collect();
        prop_assert_eq!(got, expected);
    }

    // Transfer plans carry unique tags, matching send/recv volumes,
    // and move every element exactly once.
    #[test]
    fn transfer_plan_is_consistent(a in balanced_1d(), ranks_b in 1usize..12) {
        let b = Decomposition::balanced(a.shape().to_vec(), vec![0], ranks_b).unwrap();
        let plan = build_transfer_plan(&a, &b).unwrap();

        let mut tags = BTreeSet::new();
        let mut sent = 0usize;
        for (src_rank, entries) in &plan.sends {
            for send in entries {
                prop_assert!(tags.insert(send.tag), "duplicate tag {}", send.tag);
                sent += send.window.len();

                let recv = plan.recvs[&send.peer]
                    .iter()
                    .find(|r| r.tag == send.tag && r.peer == *src_rank)
                    .unwrap();
                prop_assert_eq!(send.window.len(), recv.window.len());
            }
        }
        prop_assert_eq!(sent, a.shape()[0]);

        let received: usize = plan.recvs.values().flatten().map(|e| e.window.len()).sum();
        prop_assert_eq!(received, a.shape()[0]);
    }
}
