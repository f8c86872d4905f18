// Byte-capacity-bounded LRU cache of decoded frames
//
// Keys are (sequence id, frame index), so one cache can serve several
// open sequences while holding at most one live copy per frame.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::error::Result;
use crate::image::Image;
use crate::imgseq::ImageSequence;

type Key = (u64, usize);

pub struct ImageCache {
  capacity_bytes: usize,
  used_bytes: usize,
  entries: HashMap<Key, Image>,
  lru: VecDeque<Key>
}

impl ImageCache {
  pub fn new(capacity_bytes: usize) -> ImageCache {
    ImageCache {
      capacity_bytes: capacity_bytes,
      used_bytes: 0,
      entries: HashMap::new(),
      lru: VecDeque::new()
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn used_bytes(&self) -> usize {
    self.used_bytes
  }

  // Fetch a frame through the cache, decoding it only on a miss.
  // Least-recently-used frames are dropped once the byte capacity is
  // exceeded; a single frame larger than the whole capacity is still
  // admitted (and evicted by the next access).
  pub fn image<'a>(&'a mut self, seq: &mut ImageSequence, index: usize) -> Result<&'a Image> {
    let key = (seq.id(), index);

    if !self.entries.contains_key(&key) {
      let img = seq.image_at(index)?;
      let size = img.pixels().len();
      while self.used_bytes + size > self.capacity_bytes && !self.lru.is_empty() {
        let victim = self.lru.pop_front().unwrap();
        if let Some(old) = self.entries.remove(&victim) {
          self.used_bytes -= old.pixels().len();
        }
      }
      self.used_bytes += size;
      self.entries.insert(key, img);
      self.lru.push_back(key);
    } else {
      // Refresh recency
      if let Some(pos) = self.lru.iter().position(|&k| k == key) {
        self.lru.remove(pos);
        self.lru.push_back(key);
      }
    }

    Ok(self.entries.get(&key).unwrap())
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.lru.clear();
    self.used_bytes = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bmp;
  use crate::image::{Image, PixelFormat};
  use tempfile::tempdir;

  fn sequence_of(dir: &std::path::Path, n: usize, width: u32, height: u32) -> ImageSequence {
    let mut paths = Vec::new();
    for i in 0..n {
      let path = dir.join(format!("c{}.bmp", i));
      let data = vec![i as u8; (width * height) as usize];
      let img = Image::from_pixels(width, height, PixelFormat::Mono8, None, data).unwrap();
      bmp::save_bmp(&img, &path).unwrap();
      paths.push(path);
    }
    ImageSequence::from_image_list(paths).unwrap()
  }

  #[test]
  fn caches_and_evicts_lru() {
    let dir = tempdir().unwrap();
    let mut seq = sequence_of(dir.path(), 4, 10, 10); // 100 bytes per frame
    let mut cache = ImageCache::new(250);

    cache.image(&mut seq, 0).unwrap();
    cache.image(&mut seq, 1).unwrap();
    assert_eq!(cache.len(), 2);

    // Touch 0 so 1 becomes the eviction candidate
    cache.image(&mut seq, 0).unwrap();
    cache.image(&mut seq, 2).unwrap(); // 300 bytes > 250: evicts 1
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.used_bytes(), 200);

    let img0 = cache.image(&mut seq, 0).unwrap();
    assert_eq!(img0.line(0)[0], 0);
    let img1 = cache.image(&mut seq, 1).unwrap(); // re-decoded
    assert_eq!(img1.line(0)[0], 1);
  }

  #[test]
  fn separate_sequences_do_not_collide() {
    let dir = tempdir().unwrap();
    let mut seq_a = sequence_of(&dir.path().join("."), 1, 4, 4);
    let dir_b = tempdir().unwrap();
    let mut seq_b = sequence_of(dir_b.path(), 1, 4, 4);

    let mut cache = ImageCache::new(1 << 20);
    cache.image(&mut seq_a, 0).unwrap();
    cache.image(&mut seq_b, 0).unwrap();
    assert_eq!(cache.len(), 2);
  }
}
