use rand::seq::SliceRandom;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// returns a permutation of `0..len`
    fn permutation(len: usize) -> Vec<usize>;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn permutation(len: usize) -> Vec<usize> {
        let mut result = (0..len).collect::<Vec<_>>();
        result.shuffle(&mut rand::thread_rng());
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_is_complete() {
        let mut p = RngRandom::permutation(10);
        p.sort();
        assert_eq!(p, (0..10).collect::<Vec<_>>());
    }
}
