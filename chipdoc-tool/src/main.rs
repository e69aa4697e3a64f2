use std::path::PathBuf;

use chipdoc::iso7816::card::SmartCard;
use chipdoc::iso7816::file;
use chipdoc::{bac, hexdump, mrz, vevr};
use clap::Parser;


#[derive(Clone, Debug, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
enum Mode {
    /// List the connected PC/SC readers.
    ListReaders,

    /// Read a travel document through Basic Access Control.
    Read(ReadOpts),

    /// Read and verify a vehicle registration card.
    Vevr(VevrOpts),
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct ReadOpts {
    #[arg(short, long = "reader", default_value = "0")]
    pub reader_index: usize,

    /// Path of a text file holding the machine-readable zone.
    #[arg(short, long = "mrz")]
    pub mrz_path: PathBuf,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct VevrOpts {
    #[arg(short, long = "reader", default_value = "0")]
    pub reader_index: usize,

    /// Directory in which to store each file as <file-id>.bin.
    #[arg(short, long = "dump")]
    pub dump_dir: Option<PathBuf>,
}


fn connect(ctx: &pcsc::Context, reader_index: usize) -> pcsc::Card {
    let readers_buf_len = ctx.list_readers_len()
        .expect("failed to obtain length of buffer for PC/SC reader list");
    let mut readers_buf = vec![0u8; readers_buf_len];
    let mut readers = ctx.list_readers(&mut readers_buf)
        .expect("failed to list PC/SC readers");

    let Some(reader) = readers.nth(reader_index) else {
        panic!("no reader at index {}", reader_index)
    };
    match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(e) => panic!("failed to connect to card: {}", e),
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mode = Mode::parse();

    let ctx = pcsc::Context::establish(pcsc::Scope::User)
        .expect("failed to establish PC/SC user context");

    match mode {
        Mode::ListReaders => {
            let readers_buf_len = ctx.list_readers_len()
                .expect("failed to obtain length of buffer for PC/SC reader list");
            let mut readers_buf = vec![0u8; readers_buf_len];
            let readers = ctx.list_readers(&mut readers_buf)
                .expect("failed to list PC/SC readers");
            for (i, reader) in readers.enumerate() {
                println!("{}: {:?}", i, reader);
            }
        },
        Mode::Read(opts) => {
            let mrz_string = std::fs::read_to_string(&opts.mrz_path)
                .expect("failed to read MRZ");
            let card = connect(&ctx, opts.reader_index);
            read_travel_document(card, &mrz_string);
        },
        Mode::Vevr(opts) => {
            let card = connect(&ctx, opts.reader_index);
            read_vehicle_registration(card, opts.dump_dir);
        },
    }
}

fn read_travel_document(mut card: pcsc::Card, mrz_string: &str) {
    let mrz: mrz::Data = mrz_string.parse()
        .expect("failed to parse MRZ");
    println!("document no.:  {}", mrz.document_number.as_str());
    println!("holder:        {} / {}",
        mrz.primary_identifier.as_str(),
        mrz.secondary_identifier.as_ref().map(|s| s.as_str()).unwrap_or(""),
    );

    // select the travel-document application (prerequisite for BAC)
    let select_application = chipdoc::iso7816::apdu::Apdu {
        header: chipdoc::iso7816::apdu::CommandHeader {
            cla: 0x00,
            ins: 0xA4, // SELECT
            p1: 0b000_001_00, // select by DF name (application identifier)
            p2: 0b0000_11_00, // return no metadata, return first or only occurrence
        },
        data: chipdoc::iso7816::apdu::Data::RequestDataShort {
            request_data: vec![0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01],
        },
    };
    let response = card.communicate(&select_application)
        .expect("failed to SELECT the travel-document application");
    if response.trailer.to_word() != chipdoc::iso7816::SW_OK {
        panic!("obtained response 0x{:04X} when SELECTing the travel-document application", response.trailer.to_word());
    }

    let mrz_key = mrz.bac_key()
        .expect("failed to derive the access key from the MRZ");
    let mut secure_card = bac::establish(Box::new(card), mrz_key.as_bytes())
        .expect("failed to establish BAC");

    // read EF.COM through the encrypted channel
    match file::read_transparent(&mut secure_card, &file::select_ef(0x011E)) {
        Ok(com) => {
            println!("EF.COM:");
            print!("{}", hexdump(&com));
        },
        Err(e) => panic!("failed to read EF.COM: {}", e),
    }

    // read EF.DG1 (the chip's copy of the MRZ)
    match file::read_transparent(&mut secure_card, &file::select_ef(0x0101)) {
        Ok(dg1) => {
            println!("EF.DG1:");
            print!("{}", hexdump(&dg1));
        },
        Err(e) => panic!("failed to read EF.DG1: {}", e),
    }
}

fn read_vehicle_registration(mut card: pcsc::Card, dump_dir: Option<PathBuf>) {
    vevr::select_application(&mut card)
        .expect("failed to SELECT the registration application");

    let layout = vevr::RegistrationLayout::default();
    let registration = vevr::read_registration(&mut card, &layout)
        .expect("failed to read the registration files");

    for file in &registration.data_files {
        println!("file {:04X}:", file.file_id);
        print!("{}", hexdump(&file.contents));
    }

    if let Some(dump_dir) = dump_dir {
        std::fs::create_dir_all(&dump_dir)
            .expect("failed to create the dump directory");
        let mut dumps = vec![
            (layout.certificate_file, &registration.certificate),
            (layout.signature_file, &registration.signature),
        ];
        for file in &registration.data_files {
            dumps.push((file.file_id, &file.contents));
        }
        for (file_id, contents) in dumps {
            let path = dump_dir.join(format!("{:04X}.bin", file_id));
            std::fs::write(&path, contents)
                .unwrap_or_else(|e| panic!("failed to write {}: {}", path.display(), e));
        }
    }

    match registration.verify() {
        Ok(()) => println!("signature: GOOD"),
        Err(e) => println!("signature: BAD ({})", e),
    }
}
