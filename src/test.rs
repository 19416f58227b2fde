#![allow(clippy::unwrap_used)]

use crate::{FollowPolicy, Strategy, Traversal, Visit, VisitKind};
use std::fs;
use std::path::PathBuf;

/// Fresh directory under the system temp dir, unique per test run.
fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "bfs_{tag}_{}_{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// The classic fixture: root/{a,b}/{x,y} with a and b directories, x and y files.
fn two_level_tree(tag: &str) -> PathBuf {
    let root = scratch(tag);
    for dir in ["a", "b"] {
        fs::create_dir(root.join(dir)).unwrap();
        for file in ["x", "y"] {
            fs::write(root.join(dir).join(file), "").unwrap();
        }
    }
    root
}

type Seen = Vec<(String, u32, VisitKind, Option<i32>)>;

fn collect(traversal: &Traversal) -> (Seen, crate::Summary) {
    let mut seen = Seen::new();
    let summary = traversal
        .run(|entry| {
            seen.push((
                entry.path().to_string_lossy().into_owned(),
                entry.depth(),
                entry.kind(),
                entry.raw_error(),
            ));
            Visit::Continue
        })
        .unwrap();
    (seen, summary)
}

#[test]
fn single_file_root() {
    let root = scratch("single");
    let file = root.join("only.txt");
    fs::write(&file, "x").unwrap();

    let traversal = Traversal::init([&file]).build().unwrap();
    let (seen, summary) = collect(&traversal);

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, 0);
    assert_eq!(seen[0].2, VisitKind::Leaf);
    assert_eq!(seen[0].3, None);
    assert!(seen[0].0.ends_with("only.txt"));
    assert_eq!(summary.errors, 0);
    assert!(!summary.stopped);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn missing_root_reported_in_argv_order() {
    let root = scratch("argv");
    let file = root.join("real.txt");
    fs::write(&file, "x").unwrap();
    let missing = root.join("missing");

    let traversal = Traversal::init([&file, &missing]).build().unwrap();
    let (seen, summary) = collect(&traversal);

    assert_eq!(seen.len(), 2);
    assert!(seen[0].0.ends_with("real.txt"));
    assert_eq!(seen[0].3, None);
    assert!(seen[1].0.ends_with("missing"));
    assert_eq!(seen[1].3, Some(libc::ENOENT));
    assert_eq!(summary.errors, 1);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn bfs_emits_strict_level_order() {
    let root = two_level_tree("bfs_levels");

    let traversal = Traversal::init([&root]).build().unwrap();
    let (seen, summary) = collect(&traversal);

    let depths: Vec<u32> = seen.iter().map(|(_, depth, _, _)| *depth).collect();
    assert_eq!(depths, vec![0, 1, 1, 2, 2, 2, 2]);
    assert_eq!(summary.visits, 7);
    assert_eq!(summary.errors, 0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn bfs_keeps_directories_contiguous() {
    // Each directory's children must land as one block, so the two depth-2
    // sibling groups may not interleave.
    let root = two_level_tree("bfs_contig");

    let traversal = Traversal::init([&root]).sort(true).build().unwrap();
    let (seen, _) = collect(&traversal);
    let deep: Vec<&str> = seen
        .iter()
        .filter(|(_, depth, _, _)| *depth == 2)
        .map(|(path, _, _, _)| path.as_str())
        .collect();

    let parents: Vec<&str> = deep
        .iter()
        .map(|path| &path[..path.rfind('/').unwrap()])
        .collect();
    assert_eq!(parents[0], parents[1], "a's children split apart");
    assert_eq!(parents[2], parents[3], "b's children split apart");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn dfs_exhausts_subtrees_in_preorder() {
    let root = two_level_tree("dfs");

    let traversal = Traversal::init([&root])
        .strategy(Strategy::Dfs)
        .sort(true)
        .build()
        .unwrap();
    let (seen, _) = collect(&traversal);

    let suffixes: Vec<String> = seen
        .iter()
        .map(|(path, _, _, _)| path[root.to_string_lossy().len()..].to_owned())
        .collect();
    assert_eq!(suffixes, vec!["", "/a", "/a/x", "/a/y", "/b", "/b/x", "/b/y"]);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn prune_skips_descendants_only() {
    let root = two_level_tree("prune");

    let traversal = Traversal::init([&root]).sort(true).build().unwrap();
    let mut seen = Vec::new();
    traversal
        .run(|entry| {
            seen.push(entry.path().to_string_lossy().into_owned());
            if entry.path().ends_with("a") {
                Visit::Prune
            } else {
                Visit::Continue
            }
        })
        .unwrap();

    assert_eq!(seen.len(), 5, "root, a, b, b/x, b/y: {seen:?}");
    assert!(seen.iter().any(|p| p.ends_with("/a")), "pruned dir still visited");
    assert!(!seen.iter().any(|p| p.contains("/a/")), "descendant of pruned dir visited");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn stop_halts_after_the_returning_visit() {
    let root = two_level_tree("stop");

    let traversal = Traversal::init([&root]).build().unwrap();
    let mut count = 0u64;
    let summary = traversal
        .run(|_| {
            count += 1;
            if count == 5 { Visit::Stop } else { Visit::Continue }
        })
        .unwrap();

    assert_eq!(count, 5, "no callback after the one returning Stop");
    assert!(summary.stopped);
    assert_eq!(summary.visits, 5);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn post_order_brackets_subtrees() {
    let root = scratch("post");
    fs::create_dir(root.join("empty")).unwrap();

    let traversal = Traversal::init([&root]).post_order(true).build().unwrap();
    let (seen, _) = collect(&traversal);

    let kinds: Vec<VisitKind> = seen.iter().map(|(_, _, kind, _)| *kind).collect();
    assert_eq!(
        kinds,
        vec![VisitKind::Pre, VisitKind::Pre, VisitKind::Post, VisitKind::Post]
    );
    // Empty directory: pre and post with nothing in between.
    assert!(seen[1].0.ends_with("empty") && seen[2].0.ends_with("empty"));
    // Root closes last.
    assert_eq!(seen[0].0, seen[3].0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unreadable_directory_carries_eacces() {
    // Root ignores permission bits entirely; the scenario cannot fire.
    // SAFETY: geteuid has no side effects
    if unsafe { libc::geteuid() } == 0 {
        return;
    }

    let root = scratch("eacces");
    let locked = root.join("locked");
    fs::create_dir(&locked).unwrap();
    fs::write(locked.join("hidden.txt"), "x").unwrap();
    let mut perms = fs::metadata(&locked).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o000);
    fs::set_permissions(&locked, perms.clone()).unwrap();

    let traversal = Traversal::init([&root]).post_order(true).build().unwrap();
    let (seen, summary) = collect(&traversal);

    let pre = seen
        .iter()
        .find(|(path, _, kind, _)| path.ends_with("locked") && *kind == VisitKind::Pre)
        .expect("locked dir visited pre-order");
    assert_eq!(pre.3, Some(libc::EACCES));
    assert!(
        seen.iter().any(|(path, _, kind, _)| path.ends_with("locked") && *kind == VisitKind::Post),
        "post-order visit still fires"
    );
    assert!(!seen.iter().any(|(path, _, _, _)| path.ends_with("hidden.txt")));
    assert_eq!(summary.errors, 1);

    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&locked, perms).unwrap();
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn deepening_emits_each_entry_exactly_once() {
    let root = two_level_tree("ids");
    fs::create_dir_all(root.join("a").join("deep").join("deeper")).unwrap();
    fs::write(root.join("a").join("deep").join("deeper").join("leaf"), "").unwrap();

    let reference = Traversal::init([&root]).build().unwrap();
    let (bfs_seen, _) = collect(&reference);
    let mut bfs_paths: Vec<String> = bfs_seen.into_iter().map(|(path, ..)| path).collect();
    bfs_paths.sort();

    for strategy in [Strategy::Ids, Strategy::Eds] {
        let traversal = Traversal::init([&root])
            .strategy(strategy)
            .post_order(true)
            .build()
            .unwrap();
        let (seen, summary) = collect(&traversal);

        let mut keyed: Vec<(String, VisitKind)> = seen
            .iter()
            .map(|(path, _, kind, _)| (path.clone(), *kind))
            .collect();
        let total = keyed.len();
        keyed.sort();
        keyed.dedup();
        assert_eq!(keyed.len(), total, "{strategy:?} repeated a visit");

        let mut pre_and_leaf: Vec<String> = seen
            .iter()
            .filter(|(_, _, kind, _)| *kind != VisitKind::Post)
            .map(|(path, ..)| path.clone())
            .collect();
        pre_and_leaf.sort();
        assert_eq!(pre_and_leaf, bfs_paths, "{strategy:?} changed the emitted set");
        assert_eq!(summary.errors, 0);
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn depth_limits_bound_both_ends() {
    let root = two_level_tree("depth");

    let shallow = Traversal::init([&root]).max_depth(1).build().unwrap();
    let (seen, _) = collect(&shallow);
    assert_eq!(seen.len(), 3, "root plus the two directories");
    assert!(seen.iter().all(|(_, depth, _, _)| *depth <= 1));

    let trimmed = Traversal::init([&root]).min_depth(1).build().unwrap();
    let (seen, _) = collect(&trimmed);
    assert_eq!(seen.len(), 6, "everything but the root");
    assert!(seen.iter().all(|(_, depth, _, _)| *depth >= 1));

    // Directories at the limit still get their post-order bracket.
    let bracketed = Traversal::init([&root])
        .max_depth(1)
        .post_order(true)
        .build()
        .unwrap();
    let (seen, _) = collect(&bracketed);
    assert_eq!(
        seen.iter().filter(|(_, _, kind, _)| *kind == VisitKind::Post).count(),
        3
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn descriptor_pressure_still_completes() {
    let root = scratch("pressure");
    let mut cursor = root.clone();
    for index in 0..25 {
        cursor = cursor.join(format!("d{index}"));
        fs::create_dir(&cursor).unwrap();
        fs::write(cursor.join("file.txt"), "").unwrap();
    }

    // A budget this small forces constant eviction and ancestor reopening.
    let traversal = Traversal::init([&root]).fd_limit(Some(8)).build().unwrap();
    let (seen, summary) = collect(&traversal);

    assert_eq!(seen.len(), 1 + 25 * 2);
    assert_eq!(summary.errors, 0, "descriptor pressure leaked into results");
    assert!(seen.iter().all(|(_, _, _, errno)| errno.is_none()));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn descriptor_pressure_on_a_bushy_tree() {
    // Wide rather than deep: many distinct parent directories are pinned by
    // in-flight opens at the same time (open_cap = 2 * threads + 1 well above
    // the clamped-minimum cache capacity), so slots churn and reopen
    // constantly. No eviction may ever surface as an entry error.
    let root = scratch("bushy");
    for outer in 0..12 {
        let mid = root.join(format!("d{outer}"));
        fs::create_dir(&mid).unwrap();
        for inner in 0..6 {
            let leaf = mid.join(format!("s{inner}"));
            fs::create_dir(&leaf).unwrap();
            fs::write(leaf.join("file.txt"), "").unwrap();
        }
    }

    let traversal = Traversal::init([&root])
        .fd_limit(Some(8))
        .threads(Some(8))
        .build()
        .unwrap();
    let (seen, summary) = collect(&traversal);

    assert_eq!(seen.len(), 1 + 12 + 12 * 6 * 2);
    assert_eq!(summary.errors, 0, "descriptor churn leaked into results");
    assert!(seen.iter().all(|(_, _, _, errno)| errno.is_none()));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn paths_beyond_path_max_still_walk() {
    // Build a chain whose full path exceeds PATH_MAX. std::fs cannot create
    // it directly, so descend with mkdirat/openat the same way the walk will.
    const LEVELS: usize = 25;
    let root = scratch("longpath");
    let root_c = std::ffi::CString::new(root.clone().into_os_string().into_encoded_bytes()).unwrap();
    let mut fd = crate::fs::open_dir_at(None, &root_c, true).unwrap();
    let long_name = "x".repeat(200);
    for index in 0..LEVELS {
        let name = std::ffi::CString::new(format!("{long_name}{index:02}")).unwrap();
        // SAFETY: name is NUL-terminated and fd is a live directory descriptor
        assert_eq!(unsafe { libc::mkdirat(fd.raw(), name.as_ptr(), 0o755) }, 0);
        fd = crate::fs::open_dir_at(Some(fd.raw()), &name, false).unwrap();
    }
    drop(fd);
    assert!(root.as_os_str().len() + LEVELS * 202 > libc::PATH_MAX as usize);

    let traversal = Traversal::init([&root]).build().unwrap();
    let summary = traversal
        .run(|entry| {
            assert!(entry.raw_error().is_none(), "error at {:?}", entry.path());
            Visit::Continue
        })
        .unwrap();
    assert_eq!(summary.visits, 1 + LEVELS as u64);
    assert_eq!(summary.errors, 0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn emitted_set_is_invariant_under_thread_count() {
    let root = two_level_tree("threads");
    fs::create_dir_all(root.join("b").join("nested")).unwrap();
    fs::write(root.join("b").join("nested").join("deep.txt"), "").unwrap();

    let mut reference: Option<Vec<String>> = None;
    for threads in [1usize, 2, 8] {
        let traversal = Traversal::init([&root])
            .threads(Some(threads))
            .build()
            .unwrap();
        let (seen, _) = collect(&traversal);
        let mut paths: Vec<String> = seen.into_iter().map(|(path, ..)| path).collect();
        paths.sort();
        match &reference {
            None => reference = Some(paths),
            Some(expected) => assert_eq!(&paths, expected, "{threads} threads diverged"),
        }
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn symlink_cycle_is_reported_not_followed_forever() {
    let root = scratch("cycle");
    fs::create_dir(root.join("sub")).unwrap();
    std::os::unix::fs::symlink(&root, root.join("sub").join("loop")).unwrap();

    let traversal = Traversal::init([&root])
        .follow(FollowPolicy::Logical)
        .build()
        .unwrap();
    let (seen, summary) = collect(&traversal);

    assert!(summary.errors >= 1, "cycle went unreported");
    assert!(
        seen.iter()
            .any(|(path, _, _, errno)| path.ends_with("loop") && *errno == Some(libc::ELOOP)),
        "ELOOP not delivered: {seen:?}"
    );
    // Termination itself is the main assertion; the walk must not revisit
    // the root through the link.
    assert!(seen.len() < 20);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn follow_policies_treat_root_symlinks_differently() {
    let root = scratch("follow");
    let target = root.join("target");
    fs::create_dir(&target).unwrap();
    fs::write(target.join("inside.txt"), "").unwrap();
    let link = root.join("link");
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let physical = Traversal::init([&link]).build().unwrap();
    let (seen, _) = collect(&physical);
    assert_eq!(seen.len(), 1, "physical walk must not follow the root link");
    assert_eq!(seen[0].2, VisitKind::Leaf);

    let comfollow = Traversal::init([&link])
        .follow(FollowPolicy::ComFollow)
        .build()
        .unwrap();
    let (seen, _) = collect(&comfollow);
    assert_eq!(seen.len(), 2, "comfollow resolves the root link: {seen:?}");
    assert!(seen.iter().any(|(path, _, _, _)| path.ends_with("inside.txt")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn prefetched_stats_are_served() {
    let root = two_level_tree("statall");

    let traversal = Traversal::init([&root])
        .stat_all(true)
        .threads(Some(2))
        .build()
        .unwrap();
    let summary = traversal
        .run(|entry| {
            let stat = entry.stat().expect("stat available for every entry");
            if entry.kind() == VisitKind::Leaf {
                assert!(!stat.file_type().is_dir());
            }
            Visit::Continue
        })
        .unwrap();
    assert_eq!(summary.visits, 7);
    assert_eq!(summary.errors, 0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn sorted_children_come_back_ordered() {
    let root = scratch("sorted");
    for name in ["zebra", "apple", "mango"] {
        fs::write(root.join(name), "").unwrap();
    }

    let traversal = Traversal::init([&root]).sort(true).build().unwrap();
    let (seen, _) = collect(&traversal);
    let names: Vec<&str> = seen
        .iter()
        .skip(1)
        .map(|(path, ..)| &path[path.rfind('/').unwrap() + 1..])
        .collect();
    assert_eq!(names, vec!["apple", "mango", "zebra"]);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn running_twice_is_idempotent() {
    let root = two_level_tree("twice");
    let traversal = Traversal::init([&root]).sort(true).build().unwrap();

    let (first, _) = collect(&traversal);
    let (second, _) = collect(&traversal);
    assert_eq!(first, second);

    let _ = fs::remove_dir_all(&root);
}
