/// Trait for types having a constant default value, which `static` items
/// can be initialized with.
///
/// Kernel objects implement this to produce an *uninitialized* instance that
/// has to be set up by its `init` method before use. Everything else uses it
/// for an empty or zero state.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

impl Init for bool {
    const INIT: Self = false;
}

impl Init for u32 {
    const INIT: Self = 0;
}

impl Init for i32 {
    const INIT: Self = 0;
}

impl Init for usize {
    const INIT: Self = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_arrays_are_zeroed() {
        let table: [[Option<u32>; 3]; 2] = Init::INIT;
        assert!(table.iter().flatten().all(Option::is_none));

        let counters: [u32; 4] = Init::INIT;
        assert_eq!(counters, [0; 4]);
    }

    #[test]
    fn empty_array_vec() {
        let free: arrayvec::ArrayVec<u8, 4> = Init::INIT;
        assert!(free.is_empty());
        assert_eq!(free.capacity(), 4);
    }
}
