#![no_main]
use libfuzzer_sys::fuzz_target;
use magic_mount::Config;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(config) = Config::from_toml_str(text) {
            // anything accepted must survive a write and a re-read
            let written = config.to_toml_string().expect("serializable config");
            let reread = Config::from_toml_str(&written).expect("re-readable config");
            assert_eq!(reread.partitions, config.partitions);
            assert!(config.partitions.iter().all(|name| !name.is_empty()));

            let _ = serde_json::to_string(&config);
        }
    }
});
