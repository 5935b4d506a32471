#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use magic_mount::modules::node::merged_name;
use magic_mount::modules::partition::parse_partition_list;
use std::ffi::OsStr;

#[derive(Arbitrary, Debug)]
struct Input {
    partitions: String,
    entry: String,
}

fuzz_target!(|input: Input| {
    for name in parse_partition_list(&input.partitions) {
        assert!(!name.is_empty());
        assert!(!name.contains(','));
        assert_eq!(name.trim(), name);
    }

    // directory entries are never empty
    if !input.entry.is_empty() {
        if let Some(name) = merged_name(OsStr::new(&input.entry)) {
            assert!(!name.is_empty());
        }
    }
});
