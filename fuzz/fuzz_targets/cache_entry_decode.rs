#![no_main]

use cacheproxy::proxy::cache::{CacheEntry, CachedReply};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(entry) = CacheEntry::decode(data) {
        let _ = CachedReply::negotiate(&entry, Some("gzip"));
        if let Ok(encoded) = entry.encode() {
            let _ = CacheEntry::decode(&encoded);
        }
    }
});
