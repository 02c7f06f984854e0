use tcpmany_engine::EngineConfig;

#[test]
fn defaults_match_the_original_hardcoded_constants() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.tcp_window, 4096);
    assert_eq!(cfg.ip_ttl, 64);
    assert_eq!(cfg.recv_buffer_len, tcpmany_packet::MAX_SIZE);
    assert!(cfg.fallback_lookup);
}
