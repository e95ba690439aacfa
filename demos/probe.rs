//! Print the features of AVIF files, their gain map, and how many leading bytes were needed
use std::env;
use std::process;

fn main() {
    env_logger::init();

    let paths: Vec<String> = env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("Usage: probe <file.avif>...");
        process::exit(1);
    }

    let mut failures = 0;
    for path in &paths {
        let data = std::fs::read(path).expect("Failed to read file");

        // Feed growing prefixes the way a download would arrive.
        let mut available = data.len().min(64);
        let result = loop {
            match zenavif_info::get_details_with_size(&data[..available], data.len()) {
                Err(zenavif_info::Error::NotEnoughData) if available < data.len() => {
                    available = (available * 2).min(data.len());
                },
                result => break result,
            }
        };

        match result {
            Ok(details) => {
                let f = details.features;
                println!(
                    "{path}: {}x{}, {} bits, {} channels (from the first {available} of {} bytes)",
                    f.width,
                    f.height,
                    f.bit_depth,
                    f.num_channels,
                    data.len()
                );
                if let Some(item_id) = details.gainmap_item_id {
                    println!("  gain map in item {item_id}");
                }
            },
            Err(err) => {
                println!("{path}: {err}");
                failures += 1;
            },
        }
    }
    if failures > 0 {
        process::exit(2);
    }
}
