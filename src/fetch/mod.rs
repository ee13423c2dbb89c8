/// Fetch-Decode Pipeline Module
///
/// A generic, reusable primitive that decouples "get encoded payloads for
/// many keys in one round trip" from "decode one payload", while never
/// losing the key-to-value correlation. Block sync, account sync, and any
/// future data source all go through the same contract, composed with the
/// combinators below.
use anyhow::Result;
use async_trait::async_trait;
use futures::future;
use std::collections::HashMap;
use std::hash::Hash;

/// A batched fetcher with a per-item decoding step.
///
/// `fetch_batch` issues one batched request and returns one encoded payload
/// per input key, paired with its key; input order and multiplicity are
/// preserved (duplicate keys yield duplicate paired outputs). `decode` turns
/// a single payload into a typed output; a decode failure for any one key
/// fails the whole `fetch` call, as does any transport failure underneath
/// `fetch_batch` - there are no partial batch results.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    type Key: Clone + Eq + Hash + Send + Sync;
    type Encoded: Send;
    type Output: Send;

    /// Issue one batched request for all keys
    async fn fetch_batch(&self, keys: &[Self::Key]) -> Result<Vec<(Self::Key, Self::Encoded)>>;

    /// Decode a single payload
    async fn decode(&self, encoded: Self::Encoded) -> Result<Self::Output>;

    /// Fetch and decode, keeping every output paired with its key.
    ///
    /// Decoding of independent payloads runs concurrently; the result order
    /// follows the batch order regardless of decode completion order.
    async fn fetch(&self, keys: &[Self::Key]) -> Result<Vec<(Self::Key, Self::Output)>> {
        let batch = self.fetch_batch(keys).await?;

        future::try_join_all(batch.into_iter().map(|(key, encoded)| async move {
            let output = self.decode(encoded).await?;
            Ok::<_, anyhow::Error>((key, output))
        }))
        .await
    }
}

/// A fetcher that applies a second decoding to the same payload as its
/// inner fetcher, produced by [`add_decoding`].
pub struct WithDecoding<F, D> {
    inner: F,
    extra: D,
}

/// Attach an additional decoding over the same encoded payload: one network
/// round trip, two independent decodings, output as a pair.
pub fn add_decoding<F, D, T>(inner: F, extra: D) -> WithDecoding<F, D>
where
    F: DataFetcher,
    D: Fn(&F::Encoded) -> Result<T> + Send + Sync,
    T: Send,
{
    WithDecoding { inner, extra }
}

#[async_trait]
impl<F, D, T> DataFetcher for WithDecoding<F, D>
where
    F: DataFetcher,
    F::Encoded: Sync,
    D: Fn(&F::Encoded) -> Result<T> + Send + Sync,
    T: Send,
{
    type Key = F::Key;
    type Encoded = F::Encoded;
    type Output = (F::Output, T);

    async fn fetch_batch(&self, keys: &[Self::Key]) -> Result<Vec<(Self::Key, Self::Encoded)>> {
        self.inner.fetch_batch(keys).await
    }

    async fn decode(&self, encoded: Self::Encoded) -> Result<Self::Output> {
        let extra = (self.extra)(&encoded)?;
        let base = self.inner.decode(encoded).await?;
        Ok((base, extra))
    }
}

/// Run two independent fetchers over the same keys concurrently and merge
/// per key. Only keys present in both outputs survive; keys missing from
/// either side are dropped, not an error.
#[allow(dead_code)]
pub async fn merge_results<F1, F2, K, M, O>(
    first: &F1,
    second: &F2,
    keys: &[K],
    merge: M,
) -> Result<Vec<(K, O)>>
where
    F1: DataFetcher<Key = K>,
    F2: DataFetcher<Key = K>,
    F2::Output: Clone,
    K: Clone + Eq + Hash + Send + Sync,
    M: Fn(F1::Output, F2::Output) -> O,
{
    let (left, right) = futures::try_join!(first.fetch(keys), second.fetch(keys))?;

    let lookup: HashMap<K, F2::Output> = right.into_iter().collect();

    Ok(left
        .into_iter()
        .filter_map(|(key, a)| lookup.get(&key).cloned().map(|b| (key.clone(), merge(a, b))))
        .collect())
}

/// Three-way [`merge_results`]: only keys present in all three outputs
/// survive. The first fetcher's output order drives iteration.
#[allow(dead_code)]
pub async fn merge_results3<F1, F2, F3, K, M, O>(
    first: &F1,
    second: &F2,
    third: &F3,
    keys: &[K],
    merge: M,
) -> Result<Vec<(K, O)>>
where
    F1: DataFetcher<Key = K>,
    F2: DataFetcher<Key = K>,
    F3: DataFetcher<Key = K>,
    F2::Output: Clone,
    F3::Output: Clone,
    K: Clone + Eq + Hash + Send + Sync,
    M: Fn(F1::Output, F2::Output, F3::Output) -> O,
{
    let (left, mid, right) = futures::try_join!(first.fetch(keys), second.fetch(keys), third.fetch(keys))?;

    let mid_lookup: HashMap<K, F2::Output> = mid.into_iter().collect();
    let right_lookup: HashMap<K, F3::Output> = right.into_iter().collect();

    Ok(left
        .into_iter()
        .filter_map(|(key, a)| {
            let b = mid_lookup.get(&key).cloned()?;
            let c = right_lookup.get(&key).cloned()?;
            Some((key.clone(), merge(a, b, c)))
        })
        .collect())
}

/// Run two independent fetchers concurrently and hand both whole correlated
/// sequences to a custom combine function. Used when the merge is not a
/// simple per-key zip.
#[allow(dead_code)]
pub async fn combine_results<F1, F2, K, C, O>(first: &F1, second: &F2, keys: &[K], combine: C) -> Result<O>
where
    F1: DataFetcher<Key = K>,
    F2: DataFetcher<Key = K>,
    K: Clone + Eq + Hash + Send + Sync,
    C: FnOnce(Vec<(K, F1::Output)>, Vec<(K, F2::Output)>) -> O,
{
    let (left, right) = futures::try_join!(first.fetch(keys), second.fetch(keys))?;
    Ok(combine(left, right))
}

/// Three-way [`combine_results`]
#[allow(dead_code)]
pub async fn combine_results3<F1, F2, F3, K, C, O>(
    first: &F1,
    second: &F2,
    third: &F3,
    keys: &[K],
    combine: C,
) -> Result<O>
where
    F1: DataFetcher<Key = K>,
    F2: DataFetcher<Key = K>,
    F3: DataFetcher<Key = K>,
    K: Clone + Eq + Hash + Send + Sync,
    C: FnOnce(Vec<(K, F1::Output)>, Vec<(K, F2::Output)>, Vec<(K, F3::Output)>) -> O,
{
    let (left, mid, right) = futures::try_join!(first.fetch(keys), second.fetch(keys), third.fetch(keys))?;
    Ok(combine(left, mid, right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stub fetcher producing "payload-{key}" for every key it knows about,
    /// counting how many batch round trips were made.
    struct StubFetcher {
        known: Vec<u64>,
        batch_calls: AtomicUsize,
    }

    impl StubFetcher {
        fn new(known: &[u64]) -> Self {
            Self { known: known.to_vec(), batch_calls: AtomicUsize::new(0) }
        }

        fn calls(&self) -> usize {
            self.batch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataFetcher for StubFetcher {
        type Key = u64;
        type Encoded = String;
        type Output = String;

        async fn fetch_batch(&self, keys: &[u64]) -> Result<Vec<(u64, String)>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(keys.iter().filter(|k| self.known.contains(k)).map(|k| (*k, format!("payload-{k}"))).collect())
        }

        async fn decode(&self, encoded: String) -> Result<String> {
            if encoded.ends_with("poison") {
                anyhow::bail!("cannot decode {encoded}");
            }
            Ok(format!("decoded-{encoded}"))
        }
    }

    #[tokio::test]
    async fn test_fetch_preserves_key_correlation() {
        let fetcher = StubFetcher::new(&[1, 2, 3]);
        let results = fetcher.fetch(&[3, 1, 3]).await.unwrap();

        let keys: Vec<u64> = results.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3, 1, 3]);
        assert_eq!(results[0].1, "decoded-payload-3");
        assert_eq!(results[1].1, "decoded-payload-1");
    }

    #[tokio::test]
    async fn test_fetch_empty_keys() {
        let fetcher = StubFetcher::new(&[1, 2, 3]);
        let results = fetcher.fetch(&[]).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_fails_whole_call() {
        struct Poisoned(StubFetcher);

        #[async_trait]
        impl DataFetcher for Poisoned {
            type Key = u64;
            type Encoded = String;
            type Output = String;

            async fn fetch_batch(&self, keys: &[u64]) -> Result<Vec<(u64, String)>> {
                let mut batch = self.0.fetch_batch(keys).await?;
                if let Some(last) = batch.last_mut() {
                    last.1 = "payload-poison".to_string();
                }
                Ok(batch)
            }

            async fn decode(&self, encoded: String) -> Result<String> {
                self.0.decode(encoded).await
            }
        }

        let fetcher = Poisoned(StubFetcher::new(&[1, 2, 3]));
        assert!(fetcher.fetch(&[1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn test_add_decoding_single_round_trip() {
        let fetcher = add_decoding(StubFetcher::new(&[7]), |encoded: &String| Ok(encoded.len()));
        let results = fetcher.fetch(&[7]).await.unwrap();

        assert_eq!(results.len(), 1);
        let (key, (base, len)) = &results[0];
        assert_eq!(*key, 7);
        assert_eq!(base, "decoded-payload-7");
        assert_eq!(*len, "payload-7".len());
        // both decodings came from the same single batch call
        assert_eq!(fetcher.inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_add_decoding_extra_failure_fails_call() {
        let fetcher =
            add_decoding(StubFetcher::new(&[7]), |_: &String| anyhow::bail!("extra decoder rejected payload"));
        let result: Result<Vec<(u64, (String, ()))>> = fetcher.fetch(&[7]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_merge_results_matched_keys_only() {
        let a = StubFetcher::new(&[1, 2, 3]);
        let b = StubFetcher::new(&[2, 3, 4]);

        let merged = merge_results(&a, &b, &[1, 2, 3, 4], |left, right| (left, right)).await.unwrap();

        let keys: Vec<u64> = merged.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![2, 3]);
        assert_eq!(merged[0].1 .0, "decoded-payload-2");
        assert_eq!(merged[0].1 .1, "decoded-payload-2");
    }

    #[tokio::test]
    async fn test_merge_results3_requires_all_sides() {
        let a = StubFetcher::new(&[1, 2, 3]);
        let b = StubFetcher::new(&[2, 3, 4]);
        let c = StubFetcher::new(&[3, 4, 5]);

        let merged = merge_results3(&a, &b, &c, &[1, 2, 3, 4, 5], |x, _, _| x).await.unwrap();

        let keys: Vec<u64> = merged.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3]);
    }

    #[tokio::test]
    async fn test_combine_results_sees_whole_sequences() {
        let a = StubFetcher::new(&[1, 2]);
        let b = StubFetcher::new(&[2]);

        let (left_len, right_len) =
            combine_results(&a, &b, &[1, 2], |left, right| (left.len(), right.len())).await.unwrap();

        assert_eq!(left_len, 2);
        assert_eq!(right_len, 1);
    }
}
