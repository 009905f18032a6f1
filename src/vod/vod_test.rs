use super::parse_vod_path;

#[test]
fn vod_path_grammar() {
    let (task_id, execute_id, start_time, vod_id) =
        parse_vod_path("/vod/T1/1/1700000000/v1").expect("valid path");
    assert_eq!(task_id, "T1");
    assert_eq!(execute_id, 1);
    assert_eq!(start_time, 1_700_000_000);
    assert_eq!(vod_id, "v1");
}

#[test]
fn vod_path_rejects_other_shapes() {
    assert!(parse_vod_path("/live/cam1").is_none());
    assert!(parse_vod_path("/vod/T1/1/1700000000").is_none());
    assert!(parse_vod_path("/vod/T1/notanumber/0/v1").is_none());
    assert!(parse_vod_path("/vod//1/0/v1").is_none());
}
