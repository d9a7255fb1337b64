//! Quorum-size arithmetic shared by `BallotBox` and the candidate/leader
//! read-confirmation paths.

/// The number of grants needed for a majority of `n` voters.
pub fn majority_of(n: usize) -> usize {
    (n / 2) + 1
}
