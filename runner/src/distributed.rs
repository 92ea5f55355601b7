pub mod fs;
pub mod util;


/*
 * Coordinator-less work distribution over a shared filesystem:
 * -> every instance walks the same root and races for the ready markers
 * -> a marker is claimed by renaming it, rename(2) is atomic so only one instance wins
 * -> the claimed file is either deleted (done) or parked as unresolved for an operator
 *
 * Known gaps:
 * -> staging dirs are keyed by the base name of the job folder only
 * -> NFS without close-to-open consistency may still let two clients win a rename
 */
