pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("rmirror_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    let foo_path = tmp_dir.join("foo");
    tokio::fs::create_dir(&foo_path).await.unwrap();
    tokio::fs::write(foo_path.join("0.txt"), "0").await.unwrap();
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await.unwrap();
    tokio::fs::write(bar_path.join("1.txt"), "1").await.unwrap();
    tokio::fs::write(bar_path.join("2.txt"), "2").await.unwrap();
    tokio::fs::write(bar_path.join("3.txt"), "3").await.unwrap();
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await.unwrap();
    tokio::fs::write(baz_path.join("4.txt"), "4").await.unwrap();
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt"))
        .await
        .unwrap();
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt"))
        .await
        .unwrap();
    Ok(tmp_dir)
}

/// Sets the modification (and access) time of `path`, in seconds since the unix epoch.
pub fn set_mtime(path: &std::path::Path, seconds: i64) -> anyhow::Result<()> {
    let time = filetime::FileTime::from_unix_time(seconds, 0);
    filetime::set_symlink_file_times(path, time, time)?;
    Ok(())
}

/// Recursively compares two trees: same names, same types, same file contents and symlink
/// targets. Entries named in `skip_root` are ignored at the top level of both trees.
pub fn assert_trees_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
    skip_root: &[&str],
) -> anyhow::Result<()> {
    fn names(
        path: &std::path::Path,
        skip: &[&str],
    ) -> anyhow::Result<Vec<std::ffi::OsString>> {
        let mut names: Vec<_> = std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<Result<_, _>>()?;
        names.retain(|name| !skip.iter().any(|s| name == std::ffi::OsStr::new(s)));
        names.sort();
        Ok(names)
    }
    let src_names = names(src, skip_root)?;
    let dst_names = names(dst, skip_root)?;
    assert_eq!(src_names, dst_names, "{:?} vs {:?}", src, dst);
    for name in src_names {
        let src_path = src.join(&name);
        let dst_path = dst.join(&name);
        let src_md = std::fs::symlink_metadata(&src_path)?;
        let dst_md = std::fs::symlink_metadata(&dst_path)?;
        assert_eq!(
            src_md.file_type().is_dir(),
            dst_md.file_type().is_dir(),
            "{:?}",
            dst_path
        );
        if src_md.is_symlink() {
            assert_eq!(std::fs::read_link(&src_path)?, std::fs::read_link(&dst_path)?);
        } else if src_md.is_dir() {
            assert_trees_identical(&src_path, &dst_path, &[])?;
        } else {
            assert_eq!(std::fs::read(&src_path)?, std::fs::read(&dst_path)?, "{:?}", dst_path);
        }
    }
    Ok(())
}
