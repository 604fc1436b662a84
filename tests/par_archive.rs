use parcpk::compression::sllz::{self, SllzOptions, SllzVersion};
use parcpk::par::{NodeKind, ParArchive, ParReadOptions, ParWriteOptions};
use std::fs;
use tempfile::tempdir;

fn populate(root: &std::path::Path) {
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::create_dir_all(root.join("inner.par")).unwrap();
    fs::write(root.join("readme.txt"), b"stage data ".repeat(1000)).unwrap();
    fs::write(root.join("sub/small.bin"), [1u8, 2, 3, 4]).unwrap();
    fs::write(root.join("inner.par/nested.txt"), b"inside").unwrap();
}

#[test]
fn test_directory_round_trip() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input");
    populate(&input);

    let archive = ParArchive::from_directory(&input).unwrap();
    let par_path = dir.path().join("out.par");
    archive.save(&par_path, &ParWriteOptions::default()).unwrap();

    let flat = ParArchive::open(&par_path, &ParReadOptions::default()).unwrap();
    let mut paths: Vec<String> = flat.files().into_iter().map(|(path, _)| path).collect();
    paths.sort();
    assert_eq!(paths, vec!["inner.par", "readme.txt", "sub/small.bin"]);

    let readme = flat.find("readme.txt").unwrap();
    let file = flat.node(readme).as_file().unwrap();
    assert!(file.is_compressed);
    assert_eq!(file.decompressed_size as usize, 11_000);

    let expanded = ParArchive::open(&par_path, &ParReadOptions { recursive: true }).unwrap();
    let inner = expanded.find("inner.par").unwrap();
    assert!(matches!(expanded.node(inner).kind, NodeKind::Nested(_)));

    let output = dir.path().join("output");
    expanded.extract_to(&output).unwrap();
    assert_eq!(
        fs::read(output.join("readme.txt")).unwrap(),
        b"stage data ".repeat(1000)
    );
    assert_eq!(fs::read(output.join("sub/small.bin")).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(fs::read(output.join("inner.par/nested.txt")).unwrap(), b"inside");
}

#[test]
fn test_uncompressed_archive_is_block_aligned() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input");
    populate(&input);

    let archive = ParArchive::from_directory(&input).unwrap();
    let options = ParWriteOptions {
        compressor_version: 0,
        reset_file_dates: true,
        ..ParWriteOptions::default()
    };
    let bytes = archive.to_bytes(&options).unwrap();
    assert_eq!(&bytes[..4], b"PARC");
    assert_eq!(bytes.len() % 2048, 0);

    let reread = ParArchive::from_bytes(&bytes, &ParReadOptions::default()).unwrap();
    for (_, id) in reread.files() {
        let file = reread.node(id).as_file().unwrap();
        assert!(!file.is_compressed);
        assert_eq!(file.timestamp, 0);
    }
}

#[test]
fn test_open_missing_archive() {
    let dir = tempdir().unwrap();
    assert!(ParArchive::open(dir.path().join("absent.par"), &ParReadOptions::default()).is_err());
}

#[test]
fn test_sllz_streams_round_trip() {
    let data = b"0123456789abcdef".repeat(300);
    for version in [SllzVersion::V1, SllzVersion::V2] {
        for endianness in [0, 1] {
            let compressed = sllz::compress(&data, SllzOptions { version, endianness }).unwrap();
            assert!(sllz::is_sllz(&compressed));
            assert!(compressed.len() < data.len());
            assert_eq!(sllz::decompress(&compressed).unwrap(), data);
        }
    }
}
