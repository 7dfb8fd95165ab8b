
use proc_macro::TokenStream;

/// Runs an `async fn(Network)` test once per RNG seed, each case with its own `Network` fixture and tracing
/// subscriber, on a runtime with paused time.
///
/// Environment variables:
/// * `BLOCKSYNC_TEST_RNG_SEED`: run only this seed.
/// * `BLOCKSYNC_TEST_SAMPLES`: run seeds `0..samples` (default 1).
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
