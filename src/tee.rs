// Copyright (C) 2025 Fetchgate Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Shared stream-fan-out helper: used by the Response Adapter's
// `clone_response` (two caller-facing readers) and by the streaming/
// buffering strategies (one caller-facing reader, one background L2 tee).

use futures::stream::{self, StreamExt};

use crate::transport::ByteStream;

/// Splits one byte stream into two independent streams that each observe
/// every item exactly once, in the same order. A background task drains the
/// source and fans each item out to both channels; a receiver dropped early
/// does not block the other.
pub(crate) fn tee_bytestream(mut source: ByteStream) -> (ByteStream, ByteStream) {
    let (tx_a, rx_a) = tokio::sync::mpsc::channel(16);
    let (tx_b, rx_b) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            let a_alive = tx_a.send(item.clone()).await.is_ok();
            let b_alive = tx_b.send(item).await.is_ok();
            if !a_alive && !b_alive {
                break;
            }
        }
    });
    let left = stream::unfold(rx_a, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });
    let right = stream::unfold(rx_b, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });
    (Box::pin(left), Box::pin(right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn both_branches_observe_every_item_in_order() {
        let source: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
        ]));
        let (mut left, mut right) = tee_bytestream(source);
        let left_items: Vec<_> = (&mut left).collect().await;
        let right_items: Vec<_> = (&mut right).collect().await;
        assert_eq!(left_items.len(), 2);
        assert_eq!(right_items.len(), 2);
    }
}
