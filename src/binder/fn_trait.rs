//! Uniform call shape for handler functions of any arity.
//!
//! A handler taking `(A, B)` is called with the tuple `(A, B)` produced by
//! its descriptor tuple, so the executor never needs to know the arity.

use std::future::Future;

/// An async handler: `Fn(A, B, ..) -> impl Future`.
pub trait AsyncHandler<Args>: Send + Sync + 'static {
    type Output;
    type Future: Future<Output = Self::Output> + Send + 'static;

    fn call(&self, args: Args) -> Self::Future;
}

/// A synchronous handler: `Fn(A, B, ..) -> R`.
pub trait SyncHandler<Args>: Send + Sync + 'static {
    type Output;

    fn call(&self, args: Args) -> Self::Output;
}

macro_rules! impl_handler_for_fn ({ $($param:ident)* } => {
    impl<Func, Fut, $($param,)*> AsyncHandler<($($param,)*)> for Func
    where
        Func: Fn($($param),*) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
    {
        type Output = Fut::Output;
        type Future = Fut;

        #[inline]
        #[allow(non_snake_case)]
        fn call(&self, ($($param,)*): ($($param,)*)) -> Self::Future {
            (self)($($param,)*)
        }
    }

    impl<Func, Out, $($param,)*> SyncHandler<($($param,)*)> for Func
    where
        Func: Fn($($param),*) -> Out + Send + Sync + 'static,
    {
        type Output = Out;

        #[inline]
        #[allow(non_snake_case)]
        fn call(&self, ($($param,)*): ($($param,)*)) -> Self::Output {
            (self)($($param,)*)
        }
    }
});

impl_handler_for_fn! {}
impl_handler_for_fn! { A }
impl_handler_for_fn! { A B }
impl_handler_for_fn! { A B C }
impl_handler_for_fn! { A B C D }
impl_handler_for_fn! { A B C D E }
impl_handler_for_fn! { A B C D E F }
impl_handler_for_fn! { A B C D E F G }
impl_handler_for_fn! { A B C D E F G H }
impl_handler_for_fn! { A B C D E F G H I }
impl_handler_for_fn! { A B C D E F G H I J }
impl_handler_for_fn! { A B C D E F G H I J K }
impl_handler_for_fn! { A B C D E F G H I J K L }
// One more slot for the controller instance in front of twelve parameters.
impl_handler_for_fn! { A B C D E F G H I J K L M }

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_async<Args, F: AsyncHandler<Args>>(_f: F) {}
    fn assert_sync<Args, F: SyncHandler<Args>>(_f: F) {}

    async fn none() {}
    async fn two(_a: u32, _b: String) -> u32 {
        0
    }
    fn plain(a: i64, b: i64) -> i64 {
        a + b
    }

    #[test]
    fn functions_implement_handler_traits() {
        assert_async(none);
        assert_async(two);
        assert_async(|_a: bool| async {});
        assert_sync(plain);
        assert_sync(|| ());
    }

    #[tokio::test]
    async fn call_spreads_tuple() {
        assert_eq!(SyncHandler::call(&plain, (2, 3)), 5);
        assert_eq!(AsyncHandler::call(&two, (1, String::new())).await, 0);
    }
}
