//! Batch payload encoding for [`Container::append_all`](super::Container::append_all).
//!
//! Each payload is encoded independently, so the work parallelises cleanly.
//! With the `parallel` feature the batch runs on Rayon's global pool;
//! without it the same code path runs sequentially.  Output order always
//! matches input order, and the first error wins.

use crate::codec::{CodecError, CodecRegistry, Encoded};

pub(crate) fn encode_batch<'a>(
    registry: &CodecRegistry,
    payloads: &[&'a [u8]],
    codec:    Option<&str>,
) -> Result<Vec<Encoded<'a>>, CodecError> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        payloads
            .par_iter()
            .map(|&data| registry.encode_for_storage(codec, data))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        payloads
            .iter()
            .map(|&data| registry.encode_for_storage(codec, data))
            .collect()
    }
}
