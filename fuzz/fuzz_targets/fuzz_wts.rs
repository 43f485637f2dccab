#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    // The checkpoint reader must reject malformed text without panicking,
    // and anything it accepts must survive a write/read cycle.
    if let Ok(map) = yolo_weights::parse_wts(source) {
        let mut buf = Vec::new();
        yolo_weights::write_wts(&map, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let again = yolo_weights::parse_wts(&text).unwrap();
        assert_eq!(again.names(), map.names());
    }
});
