/*
 * replica is a quorumkv replica. It connects to the cluster socket named
 * after its own ID, then serves get/put requests and the peer consensus
 * protocol over that single socket until killed.
 */

#![warn(clippy::all)]

use quorumkv::errinput;
use quorumkv::error::Result;
use quorumkv::raft::{SeqPacket, Server};

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A replicated key/value store replica")
        .arg(clap::Arg::new("id").required(true).help("This replica's ID and socket path"))
        .arg(
            clap::Arg::new("peers")
                .num_args(1..)
                .required(true)
                .help("The IDs of all other replicas in the cluster"),
        )
        .get_matches();
    let id = args.get_one::<String>("id").expect("required").clone();
    let peers: Vec<String> =
        args.get_many::<String>("peers").expect("required").cloned().collect();
    if peers.len() < 2 {
        return errinput!("a cluster requires at least two peers");
    }

    simplelog::SimpleLogger::init(simplelog::LevelFilter::Info, simplelog::Config::default())?;

    let transport = SeqPacket::connect(&id)?;
    Server::new(id, peers, transport)?.serve()
}
