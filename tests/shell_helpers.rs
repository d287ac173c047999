//! The PTY dimension and environment-variable helpers are pure functions by
//! design so they can be driven directly, without a live channel.

use conn_supervisor::shell::{clamp_dimension, filter_environment};

#[test]
fn clamp_dimension_keeps_values_in_range() {
    assert_eq!(clamp_dimension(0), 1);
    assert_eq!(clamp_dimension(1), 1);
    assert_eq!(clamp_dimension(80), 80);
    assert_eq!(clamp_dimension(1000), 1000);
    assert_eq!(clamp_dimension(5000), 1000);
}

#[test]
fn filter_environment_keeps_allow_listed_and_clean_pairs() {
    let vars = vec![
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("MY_VAR".to_string(), "some-clean-value".to_string()),
    ];
    let filtered = filter_environment(&vars);
    let names: Vec<&str> = filtered.iter().map(|(k, _)| k.as_str()).collect();
    assert!(names.contains(&"LANG"));
    assert!(names.contains(&"TERM"));
    assert!(names.contains(&"MY_VAR"));
}

#[test]
fn filter_environment_rejects_control_characters_outside_the_allow_list() {
    let vars = vec![(
        "INJECTED".to_string(),
        "value\nwith\nnewlines".to_string(),
    )];
    let filtered = filter_environment(&vars);
    assert!(filtered.is_empty());
}
