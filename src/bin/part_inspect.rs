use clap::Parser;
use detgather::detection::ImageDetections;
use detgather::part_file;
use detgather::GatherError;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "part_inspect")]
#[command(about = "Print the header of a partial-result file left behind by a job", long_about = None)]
struct Cli {
    /// Path to a part_<rank>.bin file
    path: PathBuf,
    /// Decode the items as detections and print box counts
    #[arg(long)]
    boxes: bool,
}

fn main() -> Result<(), GatherError> {
    let cli = Cli::parse();
    let header = part_file::read_header(&cli.path)?;
    println!("File: {}", cli.path.display());
    println!("Rank: {} of {}", header.rank, header.world_size);
    println!("Items: {}", header.len);

    if cli.boxes {
        let dir = cli.path.parent().unwrap_or(Path::new("."));
        let items: Vec<ImageDetections> =
            part_file::read_part(dir, header.rank as usize, header.world_size as usize)?;
        println!("item\tclasses\tboxes");
        for (i, detections) in items.iter().enumerate() {
            println!("{}\t{}\t{}", i, detections.num_classes(), detections.num_boxes());
        }
        let total: usize = items.iter().map(ImageDetections::num_boxes).sum();
        println!("Total boxes: {}", total);
    }

    Ok(())
}
