// Incremental Delaunay triangulation with explicit adjacency bookkeeping
//
// Every edge knows its two adjacent triangles and the vertex opposite to
// it in each; every triangle knows, for each vertex, the "leading" edge
// running to the next vertex. The structures reference each other by
// index: edges and triangles are appended for new entries and
// overwritten in place when subdivided, so surviving indices stay valid.
//
// Insertion is Bowyer-Watson style: find the containing triangle, split
// it (in three, or in four across an edge when the point is exactly
// collinear with one), then restore the Delaunay condition by recursive
// edge swaps.

use crate::error::{Error, Result};
use crate::geom::{Point, Rect};

// Missing-index sentinel for edge/triangle references
pub const EMPTY: usize = usize::MAX;

#[derive(Clone, Copy, Debug)]
pub struct Edge {
  pub v0: usize,
  pub v1: usize,
  // Adjacent triangles; t1 is EMPTY on the hull
  pub t0: usize,
  pub t1: usize,
  // Vertices opposite this edge in t0 and t1
  pub w0: usize,
  pub w1: usize
}

#[derive(Clone, Copy, Debug)]
pub struct Triangle {
  pub v: [usize; 3],
  // e[i] is the edge from v[i] to v[(i+1) % 3]
  pub e: [usize; 3]
}

impl Triangle {
  pub fn contains_vertex(&self, vertex: usize) -> bool {
    self.v[0] == vertex || self.v[1] == vertex || self.v[2] == vertex
  }
}

pub struct Triangulation {
  verts: Vec<Point>,
  edges: Vec<Edge>,
  tris: Vec<Triangle>,
  num_input_points: usize
}

// Twice the signed area of (a, b, p); exactly zero iff collinear
fn side(a: Point, b: Point, p: Point) -> i64 {
  (b.x - a.x) as i64 * (p.y - a.y) as i64 - (b.y - a.y) as i64 * (p.x - a.x) as i64
}

// Circumcircle of (a, b, c) as (center_x, center_y, radius^2). For
// collinear vertices the circle degenerates: the longest of the three
// pairwise segments provides midpoint and half-length instead.
pub fn circumcircle(a: Point, b: Point, c: Point) -> (f64, f64, f64) {
  let d = 2 * (a.x as i64 * (b.y - c.y) as i64
             + b.x as i64 * (c.y - a.y) as i64
             + c.x as i64 * (a.y - b.y) as i64);
  if d == 0 {
    let (p, q) = longest_segment(a, b, c);
    let cx = (p.x + q.x) as f64 / 2.0;
    let cy = (p.y + q.y) as f64 / 2.0;
    let r2 = p.sqr_dist(q) as f64 / 4.0;
    return (cx, cy, r2);
  }

  let sq = |p: Point| (p.x as f64) * (p.x as f64) + (p.y as f64) * (p.y as f64);
  let cx = (sq(a) * (b.y - c.y) as f64
          + sq(b) * (c.y - a.y) as f64
          + sq(c) * (a.y - b.y) as f64) / d as f64;
  let cy = (sq(a) * (c.x - b.x) as f64
          + sq(b) * (a.x - c.x) as f64
          + sq(c) * (b.x - a.x) as f64) / d as f64;
  let r2 = (a.x as f64 - cx).powi(2) + (a.y as f64 - cy).powi(2);
  return (cx, cy, r2);
}

fn longest_segment(a: Point, b: Point, c: Point) -> (Point, Point) {
  let ab = a.sqr_dist(b);
  let bc = b.sqr_dist(c);
  let ca = c.sqr_dist(a);
  if ab >= bc && ab >= ca {
    (a, b)
  } else if bc >= ab && bc >= ca {
    (b, c)
  } else {
    (c, a)
  }
}

fn inside_circumcircle(p: Point, a: Point, b: Point, c: Point) -> bool {
  let (cx, cy, r2) = circumcircle(a, b, c);
  let dx = p.x as f64 - cx;
  let dy = p.y as f64 - cy;
  dx * dx + dy * dy < r2
}

// Compute the Delaunay triangulation of `points`. Three vertices of an
// enclosing super-triangle derived from `envelope` are appended after the
// input points; triangles and edges touching them are part of the result.
// All input points must be distinct and lie within the envelope.
pub fn find_delaunay_triangulation(points: &[Point], envelope: Rect) -> Result<Triangulation> {
  let mut tri = Triangulation::with_super_triangle(points, envelope);
  for i in 0..points.len() {
    tri.add_point(points[i], i)?;
  }
  return Ok(tri);
}

impl Triangulation {
  pub fn vertices(&self) -> &[Point] {
    &self.verts
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  pub fn triangles(&self) -> &[Triangle] {
    &self.tris
  }

  pub fn num_input_points(&self) -> usize {
    self.num_input_points
  }

  fn with_super_triangle(points: &[Point], envelope: Rect) -> Triangulation {
    // Margin of at least 1.5x each dimension plus 16 pixels; the legs are
    // three times the padded extent, which keeps the padded envelope
    // strictly inside the hypotenuse
    let margin_x = 3 * envelope.width as i32 / 2 + 16;
    let margin_y = 3 * envelope.height as i32 / 2 + 16;
    let apex = Point::new(envelope.x - margin_x, envelope.y - margin_y);
    let leg_x = 3 * (envelope.width as i32 + margin_x);
    let leg_y = 3 * (envelope.height as i32 + margin_y);

    let n = points.len();
    let mut verts = points.to_vec();
    verts.push(apex);
    verts.push(Point::new(apex.x, apex.y + leg_y));
    verts.push(Point::new(apex.x + leg_x, apex.y));

    let tris = vec![Triangle { v: [n, n + 1, n + 2], e: [0, 1, 2] }];
    let edges = vec![
      Edge { v0: n, v1: n + 1, t0: 0, t1: EMPTY, w0: n + 2, w1: EMPTY },
      Edge { v0: n + 1, v1: n + 2, t0: 0, t1: EMPTY, w0: n, w1: EMPTY },
      Edge { v0: n + 2, v1: n, t0: 0, t1: EMPTY, w0: n + 1, w1: EMPTY },
    ];

    Triangulation {
      verts: verts,
      edges: edges,
      tris: tris,
      num_input_points: n
    }
  }

  fn triangle_contains(&self, t: usize, p: Point) -> bool {
    let v = self.tris[t].v;
    let s0 = side(self.verts[v[0]], self.verts[v[1]], p);
    let s1 = side(self.verts[v[1]], self.verts[v[2]], p);
    let s2 = side(self.verts[v[2]], self.verts[v[0]], p);
    (s0 >= 0 && s1 >= 0 && s2 >= 0) || (s0 <= 0 && s1 <= 0 && s2 <= 0)
  }

  fn find_containing_triangle(&self, p: Point) -> Option<usize> {
    (0..self.tris.len()).find(|&t| self.triangle_contains(t, p))
  }

  // Index (within the triangle) of the edge whose endpoints are {x, y}
  fn edge_of(&self, t: usize, x: usize, y: usize) -> usize {
    for &e in &self.tris[t].e {
      let edge = &self.edges[e];
      if (edge.v0 == x && edge.v1 == y) || (edge.v0 == y && edge.v1 == x) {
        return e;
      }
    }
    panic!("triangle {} has no edge between vertices {} and {}", t, x, y);
  }

  // Retarget one adjacency slot of an edge: the slot referencing `old_t`
  // now references `new_t` with opposite vertex `new_w`
  fn update_edge_triangle(&mut self, e: usize, old_t: usize, new_t: usize, new_w: usize) {
    let edge = &mut self.edges[e];
    if edge.t0 == old_t {
      edge.t0 = new_t;
      edge.w0 = new_w;
    } else if edge.t1 == old_t {
      edge.t1 = new_t;
      edge.w1 = new_w;
    } else {
      panic!("edge {} is not adjacent to triangle {}", e, old_t);
    }
  }

  fn add_point(&mut self, p: Point, pi: usize) -> Result<()> {
    let t = self.find_containing_triangle(p)
      .ok_or(Error::InvalidParameters("point outside the triangulation envelope"))?;

    // A point exactly collinear with one of the containing triangle's
    // edges splits both triangles sharing that edge
    let tri = self.tris[t];
    for i in 0..3 {
      if side(self.verts[tri.v[i]], self.verts[tri.v[(i + 1) % 3]], p) == 0 {
        self.split_on_edge(tri.e[i], pi);
        return Ok(());
      }
    }
    self.split_triangle(t, pi);
    return Ok(());
  }

  // Split triangle `t` = (a, b, c) into (a, b, p), (b, c, p), (c, a, p)
  fn split_triangle(&mut self, t: usize, pi: usize) {
    let old = self.tris[t];
    let [a, b, c] = old.v;
    let [e_ab, e_bc, e_ca] = old.e;

    let t_abp = t; // overwritten in place
    let t_bcp = self.tris.len();
    let t_cap = self.tris.len() + 1;

    let e_pa = self.edges.len();
    let e_pb = self.edges.len() + 1;
    let e_pc = self.edges.len() + 2;

    self.edges.push(Edge { v0: pi, v1: a, t0: t_abp, t1: t_cap, w0: b, w1: c });
    self.edges.push(Edge { v0: pi, v1: b, t0: t_abp, t1: t_bcp, w0: a, w1: c });
    self.edges.push(Edge { v0: pi, v1: c, t0: t_bcp, t1: t_cap, w0: b, w1: a });

    self.tris[t_abp] = Triangle { v: [a, b, pi], e: [e_ab, e_pb, e_pa] };
    self.tris.push(Triangle { v: [b, c, pi], e: [e_bc, e_pc, e_pb] });
    self.tris.push(Triangle { v: [c, a, pi], e: [e_ca, e_pa, e_pc] });

    self.update_edge_triangle(e_ab, t, t_abp, pi);
    self.update_edge_triangle(e_bc, t, t_bcp, pi);
    self.update_edge_triangle(e_ca, t, t_cap, pi);

    let mut skip = Vec::new();
    for e in [e_ab, e_bc, e_ca] {
      self.check_and_swap(e, &mut skip);
    }
  }

  // Split edge `e` = (a, b) and both its triangles, (a, b, c) and
  // (a, b, d), into four triangles around the new point; the edge is
  // replaced by (a, p) in place plus three appended edges
  fn split_on_edge(&mut self, e: usize, pi: usize) {
    let old = self.edges[e];
    let (a, b) = (old.v0, old.v1);
    let (t_a, t_b) = (old.t0, old.t1);
    let (c, d) = (old.w0, old.w1);
    debug_assert!(t_a != EMPTY && t_b != EMPTY,
                  "a strictly interior point cannot sit on a hull edge");

    let e_ac = self.edge_of(t_a, a, c);
    let e_cb = self.edge_of(t_a, c, b);
    let e_bd = self.edge_of(t_b, b, d);
    let e_da = self.edge_of(t_b, d, a);

    let t_apc = t_a; // overwritten
    let t_bpd = t_b; // overwritten
    let t_pbc = self.tris.len();
    let t_pad = self.tris.len() + 1;

    let e_ap = e; // overwritten
    let e_pb = self.edges.len();
    let e_pc = self.edges.len() + 1;
    let e_pd = self.edges.len() + 2;

    self.edges[e_ap] = Edge { v0: a, v1: pi, t0: t_apc, t1: t_pad, w0: c, w1: d };
    self.edges.push(Edge { v0: pi, v1: b, t0: t_pbc, t1: t_bpd, w0: c, w1: d });
    self.edges.push(Edge { v0: pi, v1: c, t0: t_apc, t1: t_pbc, w0: a, w1: b });
    self.edges.push(Edge { v0: pi, v1: d, t0: t_bpd, t1: t_pad, w0: b, w1: a });

    self.tris[t_apc] = Triangle { v: [a, pi, c], e: [e_ap, e_pc, e_ac] };
    self.tris[t_bpd] = Triangle { v: [b, pi, d], e: [e_pb, e_pd, e_bd] };
    self.tris.push(Triangle { v: [pi, b, c], e: [e_pb, e_cb, e_pc] });
    self.tris.push(Triangle { v: [pi, a, d], e: [e_ap, e_da, e_pd] });

    self.update_edge_triangle(e_ac, t_a, t_apc, pi);
    self.update_edge_triangle(e_cb, t_a, t_pbc, pi);
    self.update_edge_triangle(e_bd, t_b, t_bpd, pi);
    self.update_edge_triangle(e_da, t_b, t_pad, pi);

    let mut skip = Vec::new();
    for edge in [e_ac, e_cb, e_bd, e_da, e_ap, e_pb, e_pc, e_pd] {
      self.check_and_swap(edge, &mut skip);
    }
  }

  fn violates_delaunay(&self, e: usize) -> bool {
    let edge = &self.edges[e];
    if edge.t0 == EMPTY || edge.t1 == EMPTY {
      return false;
    }
    let t0 = self.tris[edge.t0].v;
    let t1 = self.tris[edge.t1].v;
    inside_circumcircle(self.verts[edge.w1],
                        self.verts[t0[0]], self.verts[t0[1]], self.verts[t0[2]])
      || inside_circumcircle(self.verts[edge.w0],
                             self.verts[t1[0]], self.verts[t1[1]], self.verts[t1[2]])
  }

  // Check edge `e` and swap it if its two triangles violate the empty-
  // circumcircle condition, then recurse into the four edges of the
  // surrounding quadrilateral (minus those already swapped higher up)
  fn check_and_swap(&mut self, e: usize, skip: &mut Vec<usize>) {
    if skip.contains(&e) || !self.violates_delaunay(e) {
      return;
    }
    let neighbours = self.swap_edge(e);
    skip.push(e);
    for n in neighbours {
      if !skip.contains(&n) {
        self.check_and_swap(n, skip);
      }
    }
  }

  // Replace edge (a, b), shared by (a, b, c) and (a, b, d), with (c, d);
  // returns the four outer edges of the quadrilateral a-c-b-d
  fn swap_edge(&mut self, e: usize) -> [usize; 4] {
    let old = self.edges[e];
    let (a, b) = (old.v0, old.v1);
    let (t_0, t_1) = (old.t0, old.t1);
    let (c, d) = (old.w0, old.w1);

    let e_ac = self.edge_of(t_0, a, c);
    let e_cb = self.edge_of(t_0, c, b);
    let e_bd = self.edge_of(t_1, b, d);
    let e_da = self.edge_of(t_1, d, a);

    let t_adc = t_0;
    let t_bcd = t_1;
    self.edges[e] = Edge { v0: c, v1: d, t0: t_adc, t1: t_bcd, w0: a, w1: b };
    self.tris[t_adc] = Triangle { v: [a, d, c], e: [e_da, e, e_ac] };
    self.tris[t_bcd] = Triangle { v: [b, c, d], e: [e_cb, e, e_bd] };

    self.update_edge_triangle(e_ac, t_0, t_adc, d);
    self.update_edge_triangle(e_cb, t_0, t_bcd, d);
    self.update_edge_triangle(e_bd, t_1, t_bcd, c);
    self.update_edge_triangle(e_da, t_1, t_adc, c);

    return [e_ac, e_cb, e_bd, e_da];
  }
}
