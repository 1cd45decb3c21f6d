use super::*;

#[test]
fn parse_pfn_lfn_and_cred() {
    let e = parse_line("/a http://host/a /tmp/cred").unwrap().unwrap();
    assert_eq!(e.pfn, "/a");
    assert_eq!(e.lfn, "http://host/a");
    assert_eq!(e.cred.as_deref(), Some("/tmp/cred"));
    assert!(e.is_remote());
}

#[test]
fn parse_user_file_and_missing_slash() {
    let e = parse_line("data.txt 1024").unwrap().unwrap();
    assert_eq!(e.pfn, "/data.txt");
    assert_eq!(e.lfn, "1024");
    assert!(!e.is_remote());
    let e = parse_line("/out").unwrap().unwrap();
    assert!(e.lfn.is_empty());
    assert!(e.cred.is_none());
}

#[test]
fn blank_and_comment_lines_are_skipped() {
    assert!(parse_line("").unwrap().is_none());
    assert!(parse_line("   ").unwrap().is_none());
    assert!(parse_line("# generated").unwrap().is_none());
}

#[test]
fn escaped_spaces_roundtrip() {
    let e = FileEntry::new("/my file", "gsiftp://se/dir/my file");
    let line = format_line(&e);
    assert_eq!(line, "/my\\ file gsiftp://se/dir/my\\ file");
    assert_eq!(parse_line(&line).unwrap().unwrap(), e);
}

#[test]
fn parent_components_are_rejected() {
    assert!(parse_line("/../etc/passwd http://h/x").is_err());
}

#[test]
fn dynamic_list_entries() {
    let e = FileEntry::new("/@outlist", "");
    assert_eq!(e.dynamic_list(), Some("outlist"));
    assert_eq!(e.list_file_entry().unwrap().pfn, "/outlist");
    assert!(FileEntry::new("/plain", "").dynamic_list().is_none());
    assert!(FileEntry::new("/@", "").dynamic_list().is_none());
}

#[test]
fn read_and_write_list_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.1.input");
    std::fs::write(&path, "/a http://host/a\n\n/b 20.abc\n").unwrap();
    let entries = read_list(&path).unwrap();
    assert_eq!(entries.len(), 2);
    write_list(&path, &entries[1..]).unwrap();
    let again = read_list(&path).unwrap();
    assert_eq!(again, vec![FileEntry::new("/b", "20.abc")]);
}

#[test]
fn write_list_leaves_sibling_files_alone() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("out.lst");
    let user = dir.path().join("out.tmp");
    std::fs::write(&user, "user data").unwrap();

    write_list(&list, &[FileEntry::new("/r1", "http://host/r1")]).unwrap();

    assert_eq!(std::fs::read_to_string(&user).unwrap(), "user data");
    assert_eq!(read_list(&list).unwrap(), vec![FileEntry::new("/r1", "http://host/r1")]);
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names.len(), 2, "{:?}", names);
}

#[test]
fn input_and_output_lists_do_not_share_a_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("job.1.input");
    let output = dir.path().join("job.1.output");
    let inputs: Vec<FileEntry> = (0..200)
        .map(|i| FileEntry::new(format!("/in{}", i), format!("http://host/in{}", i)))
        .collect();
    let outputs: Vec<FileEntry> = (0..200)
        .map(|i| FileEntry::new(format!("/out{}", i), format!("http://host/out{}", i)))
        .collect();

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..20 {
                write_list(&input, &inputs).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..20 {
                write_list(&output, &outputs).unwrap();
            }
        });
    });

    assert_eq!(read_list(&input).unwrap(), inputs);
    assert_eq!(read_list(&output).unwrap(), outputs);
}
